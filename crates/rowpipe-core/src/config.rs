//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard memory cap (in bytes) shared by buffering transforms.
    pub mem_cap_bytes: usize,

    /// Row capacity for materialized caches; 0 keeps every row.
    pub cache_capacity: usize,

    /// Maximum number of nested node levels a flatten expands.
    pub flatten_max_depth: usize,

    /// Consecutive creates buffered by a writer before one insert call.
    pub write_batch_size: usize,

    /// Optional row cap applied to every run.
    pub max_rows: Option<usize>,

    /// Suffix appended to the target table name to name its reject table.
    pub reject_table_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mem_cap_bytes: 512 * 1024 * 1024, // 512 MiB default
            cache_capacity: 0,
            flatten_max_depth: 8,
            write_batch_size: 1000,
            max_rows: None,
            reject_table_suffix: "_reject".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `ROWPIPE_MEM_CAP_BYTES`: memory cap in bytes
    /// - `ROWPIPE_CACHE_CAPACITY`: materialized cache row capacity
    /// - `ROWPIPE_FLATTEN_MAX_DEPTH`: nested levels flattened per row
    /// - `ROWPIPE_WRITE_BATCH_SIZE`: creates per insert call
    /// - `ROWPIPE_MAX_ROWS`: global row cap
    /// - `ROWPIPE_REJECT_TABLE_SUFFIX`: reject table suffix
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<usize>("ROWPIPE_MEM_CAP_BYTES") {
            cfg.mem_cap_bytes = v;
        }

        if let Some(v) = env_parse::<usize>("ROWPIPE_CACHE_CAPACITY") {
            cfg.cache_capacity = v;
        }

        if let Some(v) = env_parse::<usize>("ROWPIPE_FLATTEN_MAX_DEPTH") {
            cfg.flatten_max_depth = v;
        }

        if let Some(v) = env_parse::<usize>("ROWPIPE_WRITE_BATCH_SIZE") {
            cfg.write_batch_size = v.max(1);
        }

        if let Some(v) = env_parse::<usize>("ROWPIPE_MAX_ROWS") {
            cfg.max_rows = Some(v);
        }

        if let Ok(s) = std::env::var("ROWPIPE_REJECT_TABLE_SUFFIX") {
            cfg.reject_table_suffix = s;
        }

        cfg
    }

    /// Name of the reject table paired with `table`.
    pub fn reject_table_name(&self, table: &str) -> String {
        format!("{}{}", table, self.reject_table_suffix)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let cfg = EngineConfig::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(cfg, back);
        assert_eq!(cfg.reject_table_name("sales"), "sales_reject");
    }
}
