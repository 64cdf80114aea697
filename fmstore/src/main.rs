use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fmstore::{CacheRegistry, Mutation, PathHandle, StorageContext, StoreConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fmstore", about = "Browse and copy across local, s3, ssh and archive locations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// list a directory
    Ls {
        #[arg(value_name = "URI")]
        uri: String,
    },
    /// show metadata of one location
    Stat {
        #[arg(value_name = "URI")]
        uri: String,
    },
    /// print a file to stdout
    Cat {
        #[arg(value_name = "URI")]
        uri: String,
    },
    /// copy a file or directory tree
    Cp {
        #[arg(value_name = "SRC")]
        src: String,
        #[arg(value_name = "DEST")]
        dest: String,
        /// Replace an existing destination
        #[arg(short, long)]
        force: bool,
    },
    /// create a directory
    Mkdir {
        #[arg(value_name = "URI")]
        uri: String,
        #[arg(short, long)]
        parents: bool,
    },
    /// delete a file or directory tree
    Rm {
        #[arg(value_name = "URI")]
        uri: String,
    },
}

fn describe(meta: &fmstore::Metadata) -> String {
    let kind = match meta.kind {
        fmstore::EntryKind::Dir => "dir",
        fmstore::EntryKind::File => "file",
        fmstore::EntryKind::Symlink => "link",
    };
    let mtime = chrono::DateTime::<chrono::Local>::from(meta.mtime).format("%Y-%m-%d %H:%M");
    format!("{kind:<4} {:>12} {mtime}", meta.size)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let config = StoreConfig::load()?;
    let registry = Arc::new(CacheRegistry::new(&config));
    let ctx = Arc::new(StorageContext::from_config(&config, registry).await);
    let coordinator = ctx.coordinator();
    let open = |uri: &str| {
        PathHandle::parse(ctx.clone(), uri).with_context(|| format!("invalid location `{uri}`"))
    };

    match cli.command {
        Commands::Ls { uri } => {
            let dir = open(&uri)?;
            let mut children = dir.iterdir().await.with_context(|| format!("failed to list {dir}"))?;
            children.sort_by_key(|c| c.name());
            for child in children {
                // answered from the listing snapshot
                let meta = child.stat().await?;
                println!("{} {}", describe(&meta), child.name());
            }
        }
        Commands::Stat { uri } => {
            let handle = open(&uri)?;
            let meta = handle.stat().await.with_context(|| format!("failed to stat {handle}"))?;
            println!("{} {handle}", describe(&meta));
        }
        Commands::Cat { uri } => {
            let handle = open(&uri)?;
            let data = handle.read_bytes().await.with_context(|| format!("failed to read {handle}"))?;
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
        Commands::Cp { src, dest, force } => {
            let src = open(&src)?;
            let mut dest = open(&dest)?;
            if dest.is_dir().await? {
                dest = dest.join(&src.name());
            }
            src.copy_to(&dest, force)
                .await
                .with_context(|| format!("failed to copy {src} to {dest}"))?;
            if let Some(dest_dir) = dest.parent() {
                coordinator.invalidate_for(&Mutation::Copy {
                    sources: vec![src.locator().clone()],
                    dest_dir: dest_dir.locator().clone(),
                });
            }
        }
        Commands::Mkdir { uri, parents } => {
            let dir = open(&uri)?;
            dir.mkdir(parents).await.with_context(|| format!("failed to create {dir}"))?;
            coordinator.invalidate_for(&Mutation::Create(dir.locator().clone()));
        }
        Commands::Rm { uri } => {
            let handle = open(&uri)?;
            handle.delete().await.with_context(|| format!("failed to delete {handle}"))?;
            coordinator.invalidate_for(&Mutation::Delete(vec![handle.locator().clone()]));
        }
    }

    tracing::debug!("cache stats: {:?}", ctx.registry().get_stats());
    Ok(())
}
