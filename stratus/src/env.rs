use once_cell::sync::Lazy;
use std::path::PathBuf;

/// where stratus keeps local cluster state.  `STRATUS_HOME` or `~/.stratus`
pub static STRATUS_HOME: Lazy<String> = Lazy::new(|| {
    std::env::var("STRATUS_HOME").unwrap_or_else(|_| {
        let home_dir: String = match dirs::home_dir() {
            None => ".".to_string(),
            Some(dir) => dir.display().to_string(),
        };
        format!("{}/.stratus", home_dir)
    })
});

/// the working directory threaded through every operation that touches the
/// local filesystem
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StratusEnv {
    home: PathBuf,
}

impl StratusEnv {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &PathBuf {
        &self.home
    }

    /// `<home>/<cluster>`
    pub fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.home.join(cluster)
    }
}

impl Default for StratusEnv {
    fn default() -> Self {
        Self::new(STRATUS_HOME.as_str())
    }
}

#[cfg(test)]
pub mod test {
    use crate::env::StratusEnv;
    use std::path::PathBuf;

    #[test]
    pub fn test_cluster_dir() {
        let env = StratusEnv::new("/tmp/stratus");
        assert_eq!(env.cluster_dir("zk"), PathBuf::from("/tmp/stratus/zk"));
    }
}
