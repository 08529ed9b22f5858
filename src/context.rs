//! Process-wide context: the one place that
//! owns the handler registry, the disk cache manager, the filecache, and
//! configuration, and that every frontend entry point reaches through.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::diskcache::DiskCacheManager;
use crate::filecache::Filecache;
use crate::handler::{Handler, HandlerRegistry};
use crate::resolve::Resolver;

/// Everything an [`crate::ops`] call or a handler implementation needs
/// that isn't carried on the `VEntry`/`VFile` it was handed.
pub struct Context {
    pub config: Config,
    pub disk_cache: DiskCacheManager,
    /// Weak object cache keyed by `canonical_path#handler`.
    pub filecache: Filecache<dyn std::any::Any + Send + Sync>,
    /// Live log mask, seeded from `config.log_mask` but mutable at runtime
    /// through `avfsstat/debug`.
    /// `config.log_mask` stays the read-once-at-startup value; this is the
    /// one `crate::log` and `crate::avfsstat` actually consult.
    log_mask: AtomicU32,
}

impl Context {
    pub fn new(config: Config) -> Arc<Self> {
        let disk_cache = DiskCacheManager::with_limits(config.disk_cache_limit, config.disk_keep_free);
        let log_mask = AtomicU32::new(config.log_mask);
        Arc::new(Context { config, disk_cache, filecache: Filecache::new(), log_mask })
    }

    pub fn log_mask(&self) -> u32 {
        self.log_mask.load(Ordering::Acquire)
    }

    pub fn set_log_mask(&self, mask: u32) {
        self.log_mask.store(mask, Ordering::Release);
    }
}

impl Default for Context {
    fn default() -> Self {
        let config = Config::default();
        let disk_cache = DiskCacheManager::with_limits(config.disk_cache_limit, config.disk_keep_free);
        let log_mask = AtomicU32::new(config.log_mask);
        Context { config, disk_cache, filecache: Filecache::new(), log_mask }
    }
}

static GLOBAL: OnceLock<Arc<Context>> = OnceLock::new();

/// Process-wide default context, built from `Config::default()` plus
/// `AVFS_DEBUG`/`AVFS_LOGFILE` environment overrides on first use.
pub fn global() -> Arc<Context> {
    GLOBAL
        .get_or_init(|| {
            let mut config = Config::default();
            config.apply_env();
            Context::new(config)
        })
        .clone()
}

/// Builds a [`Resolver`] bound to the global context's config, a fresh
/// [`HandlerRegistry`] populated by `register`, and `local_handler` as the
/// bottom (native) layer.
pub fn resolver_with(registry: Arc<HandlerRegistry>, local_handler: Arc<dyn Handler>) -> Resolver {
    Resolver::new(registry, local_handler, global().config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_context_is_a_singleton() {
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn new_context_honors_supplied_limits() {
        let mut cfg = Config::default();
        cfg.disk_cache_limit = 42;
        let ctx = Context::new(cfg);
        assert_eq!(ctx.disk_cache.disk_cache_limit(), 42);
    }
}
