use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use crate::err::StoreErr;
use crate::store::{LockTable, Manifest, StateStore};

pub const MANIFEST_FILE: &'static str = "manifest.json";

/// Keeps each manifest at `<root>/<cluster>/manifest.json`.  A save never
/// leaves a half written manifest behind: it writes a temp file in the same
/// directory, syncs it and renames it over the old one.
#[derive(Clone)]
pub struct LocalStateStore {
    root: PathBuf,
    locks: LockTable,
}

impl LocalStateStore {
    pub fn new<B>(root: B) -> Self
    where
        B: Into<PathBuf>,
    {
        let root = root.into();
        Self {
            root,
            locks: LockTable::new(),
        }
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(MANIFEST_FILE)
    }

    async fn write(&self, name: &str, json: String) -> Result<(), std::io::Error> {
        let dir = self.root.join(name);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".{}.{}.tmp", MANIFEST_FILE, Uuid::new_v4()));
        let result: Result<(), std::io::Error> = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(json.as_bytes()).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, self.manifest_path(name)).await
        }
        .await;
        if result.is_err() {
            tokio::fs::remove_file(&tmp).await.unwrap_or_default();
        }
        result
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn save(&self, name: &str, manifest: &Manifest) -> Result<(), StoreErr> {
        let json = manifest.to_json()?;
        let _lock = self.locks.lock(name).await;
        self.write(name, json)
            .await
            .map_err(|err| StoreErr::write_failed(name, err))?;
        debug!(
            "saved {} instances of cluster '{}' to {}",
            manifest.instances.len(),
            name,
            self.manifest_path(name).display()
        );
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Manifest, StoreErr> {
        let path = self.manifest_path(name);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreErr::not_found(name));
            }
            Err(err) => return Err(StoreErr::corrupt(name, err)),
        };
        Manifest::from_json(name, json.as_str())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreErr> {
        let lock = self.locks.lock(name).await;
        match tokio::fs::remove_file(self.manifest_path(name)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StoreErr::write_failed(name, err)),
        }
        // only succeeds once the directory is empty
        tokio::fs::remove_dir(self.root.join(name))
            .await
            .unwrap_or_default();
        self.locks.release(name, lock);
        Ok(())
    }
}
