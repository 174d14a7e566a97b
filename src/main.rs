use clap::{Parser, Subcommand};
use drivefs::Drive;
use drivefs::error::Result;
use drivefs::feed::{read_about, read_change_list};
use drivefs_cache::FileOperation;
use drivefs_config::Config;
use drivefs_metadata::ChangeList;
use drivefs_search::SearchOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "drivefs")]
struct Cli {
    /// Configuration file (.toml, .yaml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the tree with a full listing
    ApplyFull {
        /// About document naming the root and the changestamp watermark
        about: PathBuf,
        /// Change feeds making up the listing
        #[arg(required = true)]
        feeds: Vec<PathBuf>,
    },
    /// Apply incremental change feeds and print the changed directories
    ApplyDelta {
        #[arg(required = true)]
        feeds: Vec<PathBuf>,
    },
    /// List a directory
    Ls { path: PathBuf },
    /// Search file names
    Search {
        query: String,
        /// Only hosted documents and files with cached content
        #[arg(long, conflicts_with = "shared_with_me")]
        offline: bool,
        /// Only entries shared with you
        #[arg(long)]
        shared_with_me: bool,
        #[arg(long)]
        no_directories: bool,
        #[arg(long)]
        no_hosted: bool,
        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Keep a file available offline
    Pin { resource_id: String, content_hash: String },
    /// Undo pin
    Unpin { resource_id: String, content_hash: String },
    /// Put downloaded bytes into the cache
    Store {
        resource_id: String,
        content_hash: String,
        file: PathBuf,
        /// Move the file instead of copying it
        #[arg(long = "move")]
        move_file: bool,
    },
    /// Evict temporary files until the given number of bytes fit
    FreeSpace { bytes: u64 },
    /// Remove cached files the tree no longer knows about
    Sweep,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(std::io::stderr)).init();

    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:?}");
            return ExitCode::FAILURE;
        },
    };
    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

async fn read_feeds(paths: &[PathBuf]) -> Result<Vec<ChangeList>> {
    let mut lists = Vec::with_capacity(paths.len());
    for path in paths {
        lists.push(read_change_list(path).await?);
    }
    Ok(lists)
}

async fn run(command: Commands, config: &Config) -> Result<()> {
    let drive = Drive::open(config).await?;
    match command {
        Commands::ApplyFull { about, feeds } => {
            let about = read_about(&about).await?;
            drive.apply_full(&about, read_feeds(&feeds).await?).await?;
            println!("changestamp {}", drive.largest_changestamp().await);
        },
        Commands::ApplyDelta { feeds } => {
            for path in drive.apply_delta(read_feeds(&feeds).await?).await? {
                println!("{}", path.display());
            }
        },
        Commands::Ls { path } => {
            for entry in drive.list_children(&path).await? {
                let kind = if entry.is_directory { "d" } else { "-" };
                println!("{kind} {:>12} {}", entry.size, entry.base_name);
            }
        },
        Commands::Search { query, offline, shared_with_me, no_directories, no_hosted, limit } => {
            let options = SearchOptions {
                exclude_hosted_documents: no_hosted,
                exclude_directories: no_directories,
                shared_with_me,
                offline,
            };
            for result in drive.search(&query, options, limit).await? {
                println!("{}", result.path.display());
            }
        },
        Commands::Pin { resource_id, content_hash } => drive.pin(&resource_id, &content_hash).await?,
        Commands::Unpin { resource_id, content_hash } => drive.unpin(&resource_id, &content_hash).await?,
        Commands::Store { resource_id, content_hash, file, move_file } => {
            let operation = if move_file { FileOperation::Move } else { FileOperation::Copy };
            drive.store(&resource_id, &content_hash, &file, operation).await?;
        },
        Commands::FreeSpace { bytes } => {
            let fits = drive.free_disk_space_if_needed_for(bytes).await?;
            println!("{}", if fits { "ok" } else { "not enough space" });
        },
        Commands::Sweep => {
            println!("removed {}", drive.remove_stale_cache_files().await?);
        },
    }
    Ok(())
}
