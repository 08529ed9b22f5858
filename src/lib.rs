//! AVFS: a virtual filesystem library that exposes archive, compressed,
//! and remote file contents as ordinary directory trees, addressed
//! through specially-formed paths, e.g.
//! `/home/u/a.tar.gz#/inner/file`.
//!
//! The crate is organized around the stacked-mount model in
//! [`core_types`] (`VEntry`/`VMount`/`VFile`): every path resolves,
//! segment by segment, through a chain of [`handler::Handler`]
//! implementations layered on top of a bottom (native) [`local::LocalFs`]
//! layer, via [`resolve::Resolver`]. [`bootstrap`] wires the whole stack
//! together for a caller that just wants a working [`resolve::Resolver`].

pub mod archive;
pub mod avfsstat;
pub mod codec;
pub mod config;
pub mod context;
pub mod core_types;
pub mod diskcache;
pub mod error;
pub mod filecache;
pub mod filter;
pub mod handler;
pub mod local;
pub mod log;
pub mod namespace;
pub mod ops;
pub mod posix;
pub mod refcount;
pub mod remote;
pub mod resolve;
pub mod sfile;
pub mod stat;
pub mod vfs_limits;
pub mod volatile;

use std::path::PathBuf;
use std::sync::Arc;

use crate::archive::{extfs::Extfs, rar::RarFormat, tar::TarFormat, zip::ZipFormat, ArchiveHandler};
use crate::avfsstat::AvfsStat;
use crate::codec::CodecHandler;
use crate::context::Context;
use crate::filter::FilterHandler;
use crate::handler::{Handler, HandlerRegistry};
use crate::local::LocalFs;
use crate::resolve::Resolver;
use crate::volatile::VolatileFs;

/// Device number the first config-driven [`FilterHandler`] gets; chosen
/// well clear of the fixed handlers' `1..=10` so adding more fixed
/// handlers later doesn't collide with however many filter programs a
/// deployment configures.
const FILTER_DEV_BASE: u64 = 100;

/// Builds the registry of every handler this crate ships, in explicit,
/// stable registration order — the order auto-extension-matching tries
/// them in: compression codecs
/// first (so `a.tar.gz` peels `.gz` before `.tar` is ever considered),
/// then archive formats, then the handlers that are only ever reached
/// by explicit name (`volatile`, `avfsstat`, `extfs`).
pub fn build_registry(ctx: &Arc<Context>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(CodecHandler::gzip(1, ctx.clone()));
    registry.register(CodecHandler::bzip2(2, ctx.clone()));
    registry.register(CodecHandler::xz(3, ctx.clone()));
    registry.register(CodecHandler::zstd(4, ctx.clone()));
    registry.register(ArchiveHandler::<TarFormat>::new(5, ctx.clone()));
    registry.register(ArchiveHandler::<ZipFormat>::new(6, ctx.clone()));
    registry.register(ArchiveHandler::<RarFormat>::new(7, ctx.clone()));
    registry.register(Extfs::new(8, ctx.clone()));
    for handler in FilterHandler::from_config(FILTER_DEV_BASE, ctx.clone()) {
        registry.register(handler);
    }
    registry.register(VolatileFs::new(9));
    let avfsstat = AvfsStat::new(10, ctx.clone());
    registry.register(avfsstat.clone());
    let registry = Arc::new(registry);
    avfsstat.set_registry(registry.clone());
    registry
}

/// Builds the bottom (native) layer every path resolution starts from.
pub fn local_handler(root: impl Into<PathBuf>) -> Arc<dyn Handler> {
    LocalFs::new(0, root)
}

/// Wires [`build_registry`] and [`local_handler`] into a ready-to-use
/// [`Resolver`], rooted at `root` (typically `/`).
pub fn bootstrap(ctx: Arc<Context>, root: impl Into<PathBuf>) -> Resolver {
    let registry = build_registry(&ctx);
    let local = local_handler(root);
    Resolver::new(registry, local, ctx.config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn bootstrap_resolves_a_plain_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("hello.txt");
        std::fs::write(&file_path, b"hi").unwrap();

        let ctx = Context::new(Config::default());
        let resolver = bootstrap(ctx, dir.path());
        let entry = resolver.resolve("/hello.txt").await.unwrap();
        assert!(entry.data.as_path().unwrap().ends_with("hello.txt"));
    }
}
