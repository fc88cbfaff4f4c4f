use serde::{Deserialize, Serialize};

/// Default copy buffer: 64 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Tunables for chunk I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Buffer size used when streaming chunks into the partial artifact.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// `fsync` chunk files on release and the partial artifact after each
    /// append. Disabling trades crash durability for throughput.
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            sync_writes: default_true(),
        }
    }
}

impl EngineOptions {
    /// Buffer size with a zero value replaced by the default.
    pub(crate) fn effective_buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = EngineOptions::default();
        assert_eq!(opts.buffer_size, 64 * 1024);
        assert!(opts.sync_writes);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let opts: EngineOptions = serde_json::from_str(r#"{"sync_writes":false}"#).unwrap();
        assert_eq!(opts.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!opts.sync_writes);
    }

    #[test]
    fn zero_buffer_falls_back() {
        let opts = EngineOptions {
            buffer_size: 0,
            ..EngineOptions::default()
        };
        assert_eq!(opts.effective_buffer_size(), DEFAULT_BUFFER_SIZE);
    }
}
