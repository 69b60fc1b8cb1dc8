//! Dataset configuration.

/// Configuration for opening a dataset.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the dataset directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Size in bytes of the blocks the index layer works in.
    pub block_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            block_size: 8 * 1024,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the dataset directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the block size in bytes.
    #[must_use]
    pub const fn block_size(mut self, value: usize) -> Self {
        self.block_size = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert_eq!(config.block_size, 8192);
    }

    #[test]
    fn builder_overrides() {
        let config = Config::new().create_if_missing(false).block_size(512);
        assert!(!config.create_if_missing);
        assert_eq!(config.block_size, 512);
    }
}
