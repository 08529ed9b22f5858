//! Tiny CLI over the `volatile` in-memory handler:
//! `mkdir`/`write`/`cat`/`ls` against a namespace that exists only for
//! the life of this process, addressed through the `#volatile` handler
//! marker every other AVFS path grammar uses.
//!
//! Paths on the command line are given relative to the volatile root
//! (e.g. `/notes/todo.txt`); this binary prepends the `#volatile`
//! marker itself so a user never has to type it.

use avfs::config::Config;
use avfs::context::Context;
use avfs::core_types::OpenFlags;
use avfs::ops;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Exercise AVFS's in-memory volatile filesystem from a shell")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a directory.
    Mkdir { path: String },
    /// Create (or truncate) a file and write `data` to it.
    Write { path: String, data: String },
    /// Print a file's contents to stdout.
    Cat { path: String },
    /// List a directory's entries.
    Ls { path: String },
}

fn volatile_path(user_path: &str) -> String {
    if user_path == "/" {
        "/#volatile".to_string()
    } else {
        format!("/#volatile{user_path}")
    }
}

fn die(action: &str, err: avfs::error::ErrorKind) -> ! {
    eprintln!("{action}: {err}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    avfs::log::init_from_env();
    let cli = Cli::parse();

    let ctx = Context::new(Config::default());
    let root = std::env::current_dir().unwrap_or_else(|_| "/".into());
    let resolver = avfs::bootstrap(ctx, root);

    match cli.command {
        Command::Mkdir { path } => {
            let target = volatile_path(&path);
            ops::mkdir(&resolver, &target, 0o755).await.unwrap_or_else(|e| die("mkdir", e));
        }
        Command::Write { path, data } => {
            run_write(&resolver, &path, &data).await;
        }
        Command::Cat { path } => {
            run_cat(&resolver, &path).await;
        }
        Command::Ls { path } => {
            run_ls(&resolver, &path).await;
        }
    }
}

async fn run_write(resolver: &avfs::resolve::Resolver, path: &str, data: &str) {
    let target = volatile_path(path);
    // `mknod` is allowed to fail with `Exists`; either way the following
    // `open` truncates to the new contents.
    let _ = ops::mknod(resolver, &target, 0o644).await;
    let flags = OpenFlags { write: true, trunc: true, ..Default::default() };
    let file = ops::open(resolver, &target, flags).await.unwrap_or_else(|e| die("open", e));
    ops::write(&file, data.as_bytes()).await.unwrap_or_else(|e| die("write", e));
    ops::close(&file).await.unwrap_or_else(|e| die("close", e));
}

async fn run_cat(resolver: &avfs::resolve::Resolver, path: &str) {
    use std::io::Write as _;
    let target = volatile_path(path);
    let file = ops::open(resolver, &target, OpenFlags::read_only()).await.unwrap_or_else(|e| die("open", e));
    let mut buf = [0u8; 4096];
    loop {
        let n = ops::read(&file, &mut buf).await.unwrap_or_else(|e| die("read", e));
        if n == 0 {
            break;
        }
        std::io::stdout().write_all(&buf[..n]).expect("stdout write");
    }
    ops::close(&file).await.unwrap_or_else(|e| die("close", e));
}

async fn run_ls(resolver: &avfs::resolve::Resolver, path: &str) {
    let target = volatile_path(path);
    let entries = ops::readdir(resolver, &target).await.unwrap_or_else(|e| die("readdir", e));
    for entry in entries {
        println!("{:<20} {:?}", entry.name, entry.file_type);
    }
}

