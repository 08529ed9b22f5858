//! End-to-end coverage of the volatile in-memory filesystem's lifecycle:
//! mount `volatile`, create a directory and a file under it, write,
//! reopen and read back, then unlink/rmdir — all through the public
//! `ops` façade and the path resolver rather than calling `VolatileFs`
//! methods directly.

use avfs::config::Config;
use avfs::context::Context;
use avfs::core_types::OpenFlags;
use avfs::ops;

#[tokio::test]
async fn mkdir_write_read_unlink_rmdir_round_trip() {
    let ctx = Context::new(Config::default());
    let dir = tempfile::tempdir().unwrap();
    let resolver = avfs::bootstrap(ctx, dir.path());

    ops::mkdir(&resolver, "/#volatile/d", 0o755).await.unwrap();

    // `VolatileFs::open` has no `CREAT` support of its own: the in-memory
    // filesystem creates nodes through `mknod`/`mkdir`, not through
    // open-time flags.
    ops::mknod(&resolver, "/#volatile/d/f", 0o644).await.unwrap();

    let write_flags = OpenFlags { write: true, ..Default::default() };
    let file = ops::open(&resolver, "/#volatile/d/f", write_flags).await.unwrap();
    let n = ops::write(&file, b"abc").await.unwrap();
    assert_eq!(n, 3);
    ops::close(&file).await.unwrap();

    let file = ops::open(&resolver, "/#volatile/d/f", OpenFlags::read_only()).await.unwrap();
    let mut buf = [0u8; 3];
    let n = ops::pread(&file, &mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"abc");
    ops::close(&file).await.unwrap();

    let attr = ops::getattr(&resolver, "/#volatile/d/f").await.unwrap();
    assert_eq!(attr.size, 3);

    ops::unlink(&resolver, "/#volatile/d/f").await.unwrap();
    assert!(ops::getattr(&resolver, "/#volatile/d/f").await.is_err());

    ops::rmdir(&resolver, "/#volatile/d").await.unwrap();
    assert!(ops::getattr(&resolver, "/#volatile/d").await.is_err());
}

#[tokio::test]
async fn rmdir_rejects_nonempty_directory() {
    let ctx = Context::new(Config::default());
    let dir = tempfile::tempdir().unwrap();
    let resolver = avfs::bootstrap(ctx, dir.path());

    ops::mkdir(&resolver, "/#volatile/d", 0o755).await.unwrap();
    ops::mknod(&resolver, "/#volatile/d/f", 0o644).await.unwrap();

    let err = ops::rmdir(&resolver, "/#volatile/d").await.unwrap_err();
    assert_eq!(err, avfs::error::ErrorKind::NotEmpty);
}
