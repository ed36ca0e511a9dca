//! mkmerkle - build a metadata document and pool from a directory tree.
//!
//! Walks an existing tree, copies each regular file into the pool under
//! its SHA-256 hash, records symlink targets, and writes the JSON metadata
//! document that `merklefs` later mounts.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use merklefs_meta::FileSystem;
use merklefs_pool::{Config, DEFAULT_CONFIG};

/// Build a metadata document and pool from a directory tree.
#[derive(Parser)]
#[command(name = "mkmerkle", version, about, long_about = None)]
struct Cli {
    /// Configuration file providing the pool location
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Pool directory, overriding the configuration
    #[arg(long)]
    pool: Option<PathBuf>,

    /// Directory tree to describe
    source: PathBuf,

    /// Where to write the metadata document
    metadata: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let pool = match &cli.pool {
        Some(path) => path.clone(),
        None => {
            let config = Config::load(&cli.config).context("loading configuration")?;
            PathBuf::from(config.pool)
        }
    };
    fs::create_dir_all(&pool)
        .with_context(|| format!("creating pool directory {}", pool.display()))?;

    let mut builder = Builder::new(pool);
    builder
        .add_tree(&cli.source, "")
        .with_context(|| format!("walking {}", cli.source.display()))?;

    let mut out = BufWriter::new(
        File::create(&cli.metadata)
            .with_context(|| format!("creating {}", cli.metadata.display()))?,
    );
    serde_json::to_writer(&mut out, builder.fs())?;
    out.flush()?;

    info!(
        inodes = builder.fs().len(),
        blobs = builder.blobs_added,
        metadata = %cli.metadata.display(),
        "tree described"
    );
    Ok(())
}

/// Accumulates the metadata tree while installing blobs into the pool.
struct Builder {
    fs: FileSystem,
    pool: PathBuf,
    blobs_added: u64,
}

impl Builder {
    fn new(pool: PathBuf) -> Self {
        Self {
            fs: FileSystem::new(),
            pool,
            blobs_added: 0,
        }
    }

    fn fs(&self) -> &FileSystem {
        &self.fs
    }

    /// Records every entry below `dir` under the tree path `prefix`.
    fn add_tree(&mut self, dir: &Path, prefix: &str) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(name) => bail!("non-UTF-8 name {:?} in {}", name, dir.display()),
            };
            let tree_path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            let file_type = entry.file_type()?;
            let perm = entry.metadata()?.mode() & 0o7777;
            if file_type.is_dir() {
                self.fs.mkdir(&tree_path, perm)?;
                self.add_tree(&entry.path(), &tree_path)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                let Some(target) = target.to_str() else {
                    bail!("non-UTF-8 link target for {tree_path}");
                };
                self.fs.symlink(target, &tree_path)?;
            } else if file_type.is_file() {
                let (hash, size) = self.install_blob(&entry.path())?;
                let ino = self.fs.creat(&tree_path, perm)?;
                self.fs.set_content(ino, hash, size);
            } else {
                warn!(path = %entry.path().display(), "skipping special file");
            }
        }
        Ok(())
    }

    /// Copies `path` into the pool under its content hash. An existing
    /// blob of the same hash is reused untouched.
    fn install_blob(&mut self, path: &Path) -> Result<(String, u64)> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut file, &mut hasher)?;
        let hash = hex::encode(hasher.finalize());

        let blob = self.pool.join(&hash);
        if !blob.exists() {
            fs::copy(path, &blob)
                .with_context(|| format!("installing blob for {}", path.display()))?;
            self.blobs_added += 1;
            debug!(hash = %hash, size = size, "blob installed");
        }
        Ok((hash, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn build(source: &Path, pool: &Path) -> Builder {
        let mut builder = Builder::new(pool.to_path_buf());
        builder.add_tree(source, "").unwrap();
        builder
    }

    #[test]
    fn test_tree_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("source");
        let pool = dir.path().join("pool");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::create_dir_all(&pool).unwrap();
        fs::write(source.join("hello.txt"), b"hello world").unwrap();
        fs::write(source.join("sub/inner.txt"), b"inner").unwrap();
        symlink("hello.txt", source.join("link")).unwrap();

        let builder = build(&source, &pool);
        let fs_meta = builder.fs();

        let root = fs_meta.root_ino();
        let hello = fs_meta.lookup(root, "hello.txt");
        assert_ne!(hello, 0);
        assert_eq!(fs_meta[hello].size(), 11);

        let inner = fs_meta.lookup(root, "sub/inner.txt");
        assert_ne!(inner, 0);

        let link = fs_meta.lookup(root, "link");
        assert_eq!(fs_meta[link].readlink(), "hello.txt");

        // The blob lives in the pool under the recorded hash.
        let blob = pool.join(fs_meta[hello].blob_hash());
        assert_eq!(fs::read(blob).unwrap(), b"hello world");
    }

    #[test]
    fn test_identical_files_share_one_blob() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("source");
        let pool = dir.path().join("pool");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&pool).unwrap();
        fs::write(source.join("a"), b"same bytes").unwrap();
        fs::write(source.join("b"), b"same bytes").unwrap();

        let builder = build(&source, &pool);
        assert_eq!(builder.blobs_added, 1);

        let root = builder.fs().root_ino();
        let a = builder.fs().lookup(root, "a");
        let b = builder.fs().lookup(root, "b");
        assert_eq!(
            builder.fs()[a].blob_hash(),
            builder.fs()[b].blob_hash()
        );
    }
}
