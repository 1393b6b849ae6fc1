//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Host-configurable knobs of a runtime. Child runtimes inherit their
/// parent's configuration at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads of the process-wide pool. `None` sizes the pool by
    /// available parallelism. Only honored before the pool first runs.
    #[serde(default)]
    pub worker_threads: Option<usize>,
    /// Extension probed by the module resolver.
    #[serde(default = "default_module_extension")]
    pub module_extension: String,
    /// Connect timeout of the `net` module, in milliseconds.
    #[serde(default = "default_http_connect_timeout_ms")]
    pub http_connect_timeout_ms: u64,
}

fn default_module_extension() -> String {
    "weft".to_string()
}

fn default_http_connect_timeout_ms() -> u64 {
    30_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            module_extension: default_module_extension(),
            http_connect_timeout_ms: default_http_connect_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.module_extension, "weft");
        assert!(config.worker_threads.is_none());
        assert!(config.http_connect_timeout_ms > 0);
    }
}
