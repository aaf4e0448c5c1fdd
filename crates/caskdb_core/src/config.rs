//! Engine configuration.

/// Configuration for opening a [`crate::Db`].
///
/// # Durability
///
/// CaskDB does not sync after every write. The active segment is flushed and
/// synced when it is sealed (segment rotation), when a compaction output is
/// finished, and when the engine is closed. `sync_on_rotate(false)` drops the
/// `fsync` at those points, which is useful for tests and benchmarks.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size of a segment file before rotation, in bytes.
    pub max_segment_size: u64,

    /// Segment count at which compaction is scheduled. A merge needs at
    /// least two sealed segments plus the active one, so values below 3
    /// behave as 3.
    pub compact_threshold: usize,

    /// Whether to `fsync` segment files when sealing them.
    pub sync_on_rotate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_segment_size: 4 * 1024 * 1024, // 4 MB
            compact_threshold: 3,
            sync_on_rotate: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum segment file size.
    #[must_use]
    pub const fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets the segment count that triggers compaction.
    #[must_use]
    pub const fn compact_threshold(mut self, count: usize) -> Self {
        self.compact_threshold = count;
        self
    }

    /// Sets whether segment files are synced when sealed.
    #[must_use]
    pub const fn sync_on_rotate(mut self, value: bool) -> Self {
        self.sync_on_rotate = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_segment_size, 4 * 1024 * 1024);
        assert_eq!(config.compact_threshold, 3);
        assert!(config.sync_on_rotate);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_segment_size(150)
            .compact_threshold(4)
            .sync_on_rotate(false);

        assert_eq!(config.max_segment_size, 150);
        assert_eq!(config.compact_threshold, 4);
        assert!(!config.sync_on_rotate);
    }
}
