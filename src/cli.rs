//! One-shot commands against a filesystem stored on the host.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytesize::ByteSize;
use clap::Subcommand;
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tracing::{debug, info};

use light_fs::fs::{FileData, FileSystem, FsError, Mode, NodeType, WriteOptions};
use light_fs::store::DirRegistry;

use crate::app_config::Config;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code: the errno of the failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fs(e) => i32::from(e),
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Print a file to stdout.
    Cat { path: String },

    /// Write a file from an argument or from stdin.
    Write {
        path: String,
        /// Content to write. Read from stdin when absent.
        content: Option<String>,
        /// Octal mode of the file.
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<Mode>,
    },

    /// Create a directory.
    Mkdir {
        path: String,
        /// Create missing parents as well.
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove an empty directory.
    Rmdir { path: String },

    /// Remove a file or symlink.
    Rm { path: String },

    /// Move a file or directory.
    Mv { from: String, to: String },

    /// Create a symlink at `path` pointing at `target`.
    Ln { target: String, path: String },

    /// Print the target of a symlink.
    Readlink { path: String },

    /// Show metadata of a path.
    Stat {
        path: String,
        /// Do not follow a final symlink.
        #[arg(short = 'L', long)]
        no_follow: bool,
    },

    /// Total size of the files beneath a path.
    Du {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Register a remote file without downloading it.
    Back { path: String },

    /// Print the whole tree in superblock text form.
    Tree,

    /// Erase every file and directory.
    Wipe,
}

fn parse_mode(raw: &str) -> Result<Mode, String> {
    u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .map(Mode::from_raw)
        .map_err(|e| format!("invalid octal mode {raw:?}: {e}"))
}

fn type_label(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::File => "file",
        NodeType::Directory => "directory",
        NodeType::Symlink => "symlink",
    }
}

async fn out(text: &[u8]) -> Result<(), CliError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text).await?;
    stdout.flush().await?;
    Ok(())
}

async fn execute(fs: &FileSystem, command: Command) -> Result<(), CliError> {
    match command {
        Command::Ls { path } => {
            let mut listing = String::new();
            for name in fs.readdir(&path).await? {
                let child = light_fs::fs::path::join(&path, &name);
                let suffix = match fs.lstat(&child).await?.node_type {
                    NodeType::Directory => "/",
                    NodeType::Symlink => "@",
                    NodeType::File => "",
                };
                listing.push_str(&name);
                listing.push_str(suffix);
                listing.push('\n');
            }
            out(listing.as_bytes()).await
        }
        Command::Cat { path } => {
            let data = fs.read_file(&path, None).await?;
            out(&data.into_bytes()).await
        }
        Command::Write {
            path,
            content,
            mode,
        } => {
            let data = match content {
                Some(text) => FileData::Text(text),
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    FileData::from(buf)
                }
            };
            let stat = fs
                .write_file(
                    &path,
                    data,
                    WriteOptions {
                        mode,
                        encoding: None,
                    },
                )
                .await?;
            debug!(path = %path, ino = stat.ino, size = stat.size, "wrote file");
            Ok(())
        }
        Command::Mkdir { path, parents } => {
            if parents {
                let mut prefix = String::new();
                for seg in light_fs::fs::path::segments(&light_fs::fs::path::normalize(&path)) {
                    prefix.push('/');
                    prefix.push_str(seg);
                    match fs.mkdir(&prefix, None).await {
                        Ok(_) | Err(FsError::AlreadyExists(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            } else {
                fs.mkdir(&path, None).await?;
                Ok(())
            }
        }
        Command::Rmdir { path } => Ok(fs.rmdir(&path).await?),
        Command::Rm { path } => Ok(fs.unlink(&path).await?),
        Command::Mv { from, to } => Ok(fs.rename(&from, &to).await?),
        Command::Ln { target, path } => {
            fs.symlink(&target, &path).await?;
            Ok(())
        }
        Command::Readlink { path } => {
            let target = fs.readlink(&path).await?;
            out(format!("{target}\n").as_bytes()).await
        }
        Command::Stat { path, no_follow } => {
            let stat = if no_follow {
                fs.lstat(&path).await?
            } else {
                fs.stat(&path).await?
            };
            let mtime_ms = stat
                .mtime
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis());
            let mut text = format!(
                "path: {path}\ntype: {}\nino: {}\nmode: {:o}\nsize: {}\nmtime-ms: {mtime_ms}\n",
                type_label(stat.node_type),
                stat.ino,
                stat.mode.bits(),
                stat.size,
            );
            if let Some(target) = stat.target {
                text.push_str(&format!("target: {target}\n"));
            }
            out(text.as_bytes()).await
        }
        Command::Du { path } => {
            let total = fs.du(&path).await?;
            out(format!("{}\t{path}\n", ByteSize::b(total)).as_bytes()).await
        }
        Command::Back { path } => {
            let stat = fs.back_file(&path, None).await?;
            info!(path = %path, size = stat.size, "registered remote file");
            Ok(())
        }
        Command::Tree => {
            let text = fs.superblock_text().await?;
            out(text.as_bytes()).await
        }
        Command::Wipe => {
            // Activation with `wipe` set already did the work.
            Ok(fs.flush().await?)
        }
    }
}

async fn run(config: Config, command: Command) -> Result<(), CliError> {
    let registry = Arc::new(DirRegistry::new(&config.data_dir));
    let mut options = config.fs_options();
    options.wipe = matches!(command, Command::Wipe);

    debug!(name = %config.name, data_dir = %config.data_dir.display(), "opening filesystem");
    let fs = FileSystem::open(registry, &config.name, options);

    let outcome = execute(&fs, command).await;
    let closed = fs.close().await;
    outcome?;
    Ok(closed?)
}

/// Run a single command to completion on a fresh runtime.
pub fn spawn(config: Config, command: Command) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("Failed to create Tokio runtime: {e}"));
    runtime.block_on(run(config, command))
}
