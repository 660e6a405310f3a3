//! Stream configuration.
//!
//! Resolved once, from defaults or from `LINPUT_*` environment variables,
//! and read without further cost afterwards.

use std::path::{Path, PathBuf};

/// Environment variable naming the directory remote paths resolve against.
pub const ENV_REMOTE_ROOT: &str = "LINPUT_REMOTE_ROOT";

/// Environment variable overriding the scratch ceiling, in bytes.
pub const ENV_MAX_SCRATCH: &str = "LINPUT_MAX_SCRATCH";

/// Default ceiling for a single scratch buffer (64MB).
pub const DEFAULT_MAX_SCRATCH: usize = 64 * 1024 * 1024;

/// Configuration shared by the stream table and the handles using it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Root for paths opened with the remote flag. Remote opens fail when
    /// this is unset.
    pub remote_root: Option<PathBuf>,

    /// Largest scratch buffer a single read may request. Larger requests
    /// report "no data".
    pub max_scratch: usize,
}

impl StreamConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary variable lookup.
    ///
    /// Unparseable or empty values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let remote_root = lookup(ENV_REMOTE_ROOT)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let max_scratch = lookup(ENV_MAX_SCRATCH)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_MAX_SCRATCH);
        Self {
            remote_root,
            max_scratch,
        }
    }

    /// Set the remote root.
    pub fn with_remote_root(mut self, root: impl AsRef<Path>) -> Self {
        self.remote_root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Set the scratch ceiling.
    pub fn with_max_scratch(mut self, bytes: usize) -> Self {
        self.max_scratch = bytes;
        self
    }

    /// Resolve a remote path against the remote root.
    ///
    /// Leading separators are stripped so a remote absolute path cannot
    /// escape the root by replacing it.
    pub fn resolve_remote(&self, path: &str) -> Option<PathBuf> {
        let root = self.remote_root.as_ref()?;
        Some(root.join(path.trim_start_matches(['/', '\\'])))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            remote_root: None,
            max_scratch: DEFAULT_MAX_SCRATCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = StreamConfig::from_lookup(lookup(&[]));
        assert_eq!(config, StreamConfig::default());
        assert!(config.resolve_remote("a.bin").is_none());
    }

    #[test]
    fn test_env_values() {
        let config = StreamConfig::from_lookup(lookup(&[
            (ENV_REMOTE_ROOT, "/srv/remote"),
            (ENV_MAX_SCRATCH, "4096"),
        ]));
        assert_eq!(config.remote_root, Some(PathBuf::from("/srv/remote")));
        assert_eq!(config.max_scratch, 4096);
    }

    #[test]
    fn test_bad_scratch_falls_back() {
        let config = StreamConfig::from_lookup(lookup(&[(ENV_MAX_SCRATCH, "lots")]));
        assert_eq!(config.max_scratch, DEFAULT_MAX_SCRATCH);
    }

    #[test]
    fn test_empty_remote_root_ignored() {
        let config = StreamConfig::from_lookup(lookup(&[(ENV_REMOTE_ROOT, "")]));
        assert!(config.remote_root.is_none());
    }

    #[test]
    fn test_resolve_remote_stays_under_root() {
        let config = StreamConfig::default().with_remote_root("/srv/remote");
        assert_eq!(
            config.resolve_remote("/bin/sample"),
            Some(PathBuf::from("/srv/remote/bin/sample"))
        );
    }
}
