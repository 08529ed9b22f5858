//! Mirrors an archive's (or compressed file's) decoded contents onto a
//! real directory tree, exercising the auto `#` path grammar including
//! its chained form: a `bundle.tar.gz` is reached
//! by mounting the gzip codec first and the tar archive handler second,
//! `ugz` -> `utar` (see [`avfs::resolve`]'s bare-`#` auto-match).
//!
//! Usage: `mirror_archive <source> <dest>`. `source` is a real path to
//! a `.tar`, `.zip`, `.rar`, `.gz`/`.tar.gz`/... file; `dest` is created
//! as a directory (for archive contents) or as a single output file
//! (for a plain compressed file with nothing further to chain into).

use std::path::{Path, PathBuf};

use avfs::config::Config;
use avfs::context::Context;
use avfs::core_types::OpenFlags;
use avfs::ops;
use avfs::resolve::Resolver;
use avfs::stat::FileType;

use clap::Parser;

#[derive(Parser)]
#[command(about = "Mirror an AVFS-mounted archive onto a real directory")]
struct Cli {
    /// Real filesystem path to the archive or compressed file.
    source: PathBuf,
    /// Destination: a directory for archive contents, or an output file
    /// path when `source` has nothing left to chain into.
    dest: PathBuf,
}

/// Chains bare `#` auto-mounts onto `virtual_path` until the resolved
/// entry stops being a plain file, or the chain runs out of formats to
/// peel (e.g. a `.txt.gz` of ordinary text has nothing beyond `ugz`).
/// Bounded the way every other path-shaped limit in this crate is (here,
/// a handful of container layers is already generous for real files).
const MAX_CHAIN_DEPTH: u32 = 8;

async fn chain_to_leaf_or_dir(resolver: &Resolver, mut virtual_path: String) -> (String, avfs::stat::AvStat) {
    let mut attr = ops::getattr(resolver, &virtual_path).await.unwrap_or_else(|e| die("stat", e));
    let mut depth = 0;
    while attr.file_type == FileType::Regular && depth < MAX_CHAIN_DEPTH {
        let candidate = format!("{virtual_path}/#");
        match ops::getattr(resolver, &candidate).await {
            Ok(next_attr) => {
                virtual_path = candidate;
                attr = next_attr;
                depth += 1;
            }
            Err(_) => break,
        }
    }
    (virtual_path, attr)
}

fn die(action: &str, err: avfs::error::ErrorKind) -> ! {
    eprintln!("{action}: {err}");
    std::process::exit(1);
}

async fn copy_file(resolver: &Resolver, virtual_path: &str, dest: &Path) {
    let file = ops::open(resolver, virtual_path, OpenFlags::read_only()).await.unwrap_or_else(|e| die("open", e));
    let mut out = std::fs::File::create(dest).unwrap_or_else(|e| {
        eprintln!("create {}: {e}", dest.display());
        std::process::exit(1);
    });
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = ops::read(&file, &mut buf).await.unwrap_or_else(|e| die("read", e));
        if n == 0 {
            break;
        }
        std::io::Write::write_all(&mut out, &buf[..n]).unwrap_or_else(|e| {
            eprintln!("write {}: {e}", dest.display());
            std::process::exit(1);
        });
    }
    ops::close(&file).await.unwrap_or_else(|e| die("close", e));
}

fn mirror_dir<'a>(
    resolver: &'a Resolver,
    virtual_path: String,
    dest: PathBuf,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>> {
    Box::pin(async move {
        std::fs::create_dir_all(&dest).unwrap_or_else(|e| {
            eprintln!("mkdir {}: {e}", dest.display());
            std::process::exit(1);
        });
        let entries = ops::readdir(resolver, &virtual_path).await.unwrap_or_else(|e| die("readdir", e));
        for entry in entries {
            let child_virtual = format!("{virtual_path}/{}", entry.name);
            let child_dest = dest.join(&entry.name);
            match entry.file_type {
                FileType::Directory => mirror_dir(resolver, child_virtual, child_dest).await,
                _ => copy_file(resolver, &child_virtual, &child_dest).await,
            }
        }
    })
}

#[tokio::main]
async fn main() {
    avfs::log::init_from_env();
    let cli = Cli::parse();

    let source = std::fs::canonicalize(&cli.source).unwrap_or_else(|e| {
        eprintln!("{}: {e}", cli.source.display());
        std::process::exit(1);
    });

    let ctx = Context::new(Config::default());
    let resolver = avfs::bootstrap(ctx, "/");

    let virtual_source = format!("{}#", source.display());
    let (leaf_path, attr) = chain_to_leaf_or_dir(&resolver, virtual_source).await;

    match attr.file_type {
        FileType::Directory => mirror_dir(&resolver, leaf_path, cli.dest.clone()).await,
        _ => copy_file(&resolver, &leaf_path, &cli.dest).await,
    }

    println!("mirrored {} -> {}", source.display(), cli.dest.display());
}
