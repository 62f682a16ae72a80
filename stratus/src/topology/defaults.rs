use once_cell::sync::Lazy;
use std::collections::HashMap;

/// blob store providers implied by a compute provider when the topology does
/// not name one explicitly
static DEFAULT_BLOB_STORES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("ec2", "aws-s3");
    map.insert("aws-ec2", "aws-s3");
    map.insert("cloudservers", "cloudfiles-us");
    map.insert("cloudservers-us", "cloudfiles-us");
    map.insert("cloudservers-uk", "cloudfiles-uk");
    map
});

/// The compute provider → blob store provider lookup.  Starts from the built in
/// table and may be extended or overridden by the caller.  Unknown compute
/// providers simply have no default.
#[derive(Clone, Debug)]
pub struct BlobStoreDefaults {
    mappings: HashMap<String, String>,
}

impl Default for BlobStoreDefaults {
    fn default() -> Self {
        let mappings = DEFAULT_BLOB_STORES
            .iter()
            .map(|(compute, blob)| (compute.to_string(), blob.to_string()))
            .collect();
        Self { mappings }
    }
}

impl BlobStoreDefaults {
    pub fn empty() -> Self {
        Self {
            mappings: HashMap::new(),
        }
    }

    pub fn with_mapping<C, B>(mut self, compute: C, blob: B) -> Self
    where
        C: ToString,
        B: ToString,
    {
        self.mappings.insert(compute.to_string(), blob.to_string());
        self
    }

    pub fn lookup(&self, compute: &str) -> Option<String> {
        self.mappings.get(compute).cloned()
    }
}

#[cfg(test)]
pub mod test {
    use crate::topology::defaults::BlobStoreDefaults;

    #[test]
    pub fn test_lookup() {
        let defaults = BlobStoreDefaults::default();
        assert_eq!(defaults.lookup("aws-ec2"), Some("aws-s3".to_string()));
        assert_eq!(
            defaults.lookup("cloudservers-uk"),
            Some("cloudfiles-uk".to_string())
        );
        assert_eq!(defaults.lookup("stub"), None);
    }

    #[test]
    pub fn test_override() {
        let defaults = BlobStoreDefaults::default()
            .with_mapping("aws-ec2", "minio")
            .with_mapping("stub", "memory");
        assert_eq!(defaults.lookup("aws-ec2"), Some("minio".to_string()));
        assert_eq!(defaults.lookup("stub"), Some("memory".to_string()));
        assert_eq!(BlobStoreDefaults::empty().lookup("aws-ec2"), None);
    }
}
