//! Configuration.
//!
//! Loaded from a TOML file via `serde`/`toml`, or built programmatically;
//! backs the tunables `avfsstat` exposes for live introspection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Four-level log mask, as an octal-style bitmask.
pub mod log_mask {
    pub const ERROR: u32 = 0b0001;
    pub const WARNING: u32 = 0b0010;
    pub const SYSCALL: u32 = 0b0100;
    pub const DEBUG: u32 = 0b1000;
    /// Default mask: ERROR and WARNING on, SYSCALL and DEBUG off.
    pub const DEFAULT: u32 = ERROR | WARNING;
}

/// Process-wide AVFS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `disk_cache_limit` default 100 MiB.
    pub disk_cache_limit: i64,
    /// `disk_keep_free` default 10 MiB.
    pub disk_keep_free: i64,
    /// Temp directory base; a per-process
    /// subdirectory `.avfs_tmp_XXXXXX` is created beneath this.
    pub temp_dir_base: PathBuf,
    /// Log mask, overridable by `AVFS_DEBUG`.
    pub log_mask: u32,
    /// `ZCACHE_EXTRA_DIST`: models the cost of restoring a saved decoder
    /// state as equivalent to this many inflated bytes. Valid range:
    /// `[10_000, 500_000]`.
    pub restore_cost_bytes: u64,
    /// `INDEX_DISTANCE`: checkpoint spacing for the codec layer, default
    /// 1 MiB.
    pub index_distance: u64,
    /// Symlink hop budget, default 10.
    pub symlink_budget: u32,
    /// Path segment count tripwire, default 1000.
    pub max_path_segments: u32,
    /// Timeout for child-process pipe reads, default 20s.
    pub filter_timeout_secs: u64,
    /// `extfs` helper programs, each
    /// pairing a base-file extension (`.deb`, `.iso`, ...) with the path
    /// of the external script invoked to `list`/`copyout` its contents.
    /// Empty by default: no helper ships with this crate, mirroring the
    /// original's `extfs.ini` being a deployment-time file, not a
    /// built-in list.
    pub extfs_helpers: Vec<ExtfsHelper>,
    /// `filter` helper programs, each
    /// pairing a base-file extension with a forward (decompress) and
    /// reverse (compress) argv. Empty by default, same reasoning as
    /// `extfs_helpers`: these are deployment-time bindings, not a
    /// built-in list of external tools this crate would have to trust.
    pub filter_programs: Vec<FilterProgram>,
}

/// One `extension -> helper program` mapping for [`crate::archive::extfs`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtfsHelper {
    pub extension: String,
    pub program: PathBuf,
}

/// One `extension -> (forward, reverse)` binding for [`crate::filter`].
/// `forward` decompresses (reads a compressed base file, writes plain
/// bytes to stdout); `reverse` does the opposite and is only invoked on
/// a write-back, which this crate does not currently expose (see
/// `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterProgram {
    pub extension: String,
    pub forward: Vec<String>,
    pub reverse: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            disk_cache_limit: 100 * 1024 * 1024,
            disk_keep_free: 10 * 1024 * 1024,
            temp_dir_base: std::env::temp_dir(),
            log_mask: log_mask::DEFAULT,
            restore_cost_bytes: 45_000,
            index_distance: 1024 * 1024,
            symlink_budget: 10,
            max_path_segments: 1000,
            filter_timeout_secs: 20,
            extfs_helpers: Vec::new(),
            filter_programs: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults for any field the
    /// file omits (the `#[serde(default)]` on the struct makes every
    /// field optional in the source text).
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `AVFS_DEBUG` (two-octal-digit mask) if set.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("AVFS_DEBUG") {
            if let Ok(mask) = u32::from_str_radix(val.trim(), 8) {
                self.log_mask = mask;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.disk_cache_limit, 100 * 1024 * 1024);
        assert_eq!(cfg.disk_keep_free, 10 * 1024 * 1024);
        assert_eq!(cfg.restore_cost_bytes, 45_000);
        assert_eq!(cfg.symlink_budget, 10);
        assert_eq!(cfg.max_path_segments, 1000);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml_str("disk_cache_limit = 42").unwrap();
        assert_eq!(cfg.disk_cache_limit, 42);
        assert_eq!(cfg.disk_keep_free, 10 * 1024 * 1024);
    }

    #[test]
    fn env_var_overrides_log_mask() {
        std::env::set_var("AVFS_DEBUG", "17");
        let mut cfg = Config::default();
        cfg.apply_env();
        assert_eq!(cfg.log_mask, 0o17);
        std::env::remove_var("AVFS_DEBUG");
    }
}
