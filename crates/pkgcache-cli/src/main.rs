#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_possible_truncation)]

mod commands;
mod logging;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use pkgcache_core::config::{self, ConfigLayer};
use pkgcache_core::CacheService;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pkgcache")]
#[command(author, version, about = "npm-compatible package cache and fetcher", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Cache directory (default: ~/.npm)
    #[arg(long, global = true, value_name = "DIR")]
    cache: Option<PathBuf>,

    /// Registry URL
    #[arg(long, global = true, value_name = "URL")]
    registry: Option<String>,

    /// Refetch even when cached; accept packages without a shasum
    #[arg(long, global = true)]
    force: bool,

    /// Node version checked against `engines.node` (default: `node --version`)
    #[arg(long, global = true, value_name = "VERSION")]
    node_version: Option<String>,

    /// Override the working directory (for .npmrc lookup and relative paths)
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Manipulate the package cache
    Cache {
        #[command(subcommand)]
        cache_cmd: CacheCommands,
    },

    /// Show the manifest a specifier resolves to
    View {
        /// Package specifier (e.g. "react", "react@^18", "@types/node@latest")
        spec: String,
    },

    /// Refresh the local copy of the registry's package index
    UpdateIndex {
        /// Skip the update when the index is younger than this many seconds
        #[arg(long, default_value_t = 0)]
        staleness: u64,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CacheCommands {
    /// Add packages to the cache
    Add {
        /// Specifiers: names, ranges, tags, tarball URLs, git URLs, paths
        #[arg(required = true)]
        specs: Vec<String>,
    },

    /// List cached packages
    Ls {
        /// Only list ids starting with this prefix
        prefix: Option<String>,
    },

    /// Remove cached packages (everything when no target is given)
    Clean {
        /// `name` or `name@version`
        target: Option<String>,
    },

    /// Print the cached manifest for a package version
    Read {
        name: String,
        version: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Version) {
        return commands::version::run(cli.json);
    }

    logging::init(cli.verbose, cli.json);

    let cwd = cli
        .cwd
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut overrides = ConfigLayer::new("cli");
    if let Some(cache) = &cli.cache {
        overrides.set("cache", cache.display().to_string());
    }
    if let Some(registry) = &cli.registry {
        overrides.set("registry", registry.clone());
    }
    if cli.force {
        overrides.set("force", "true");
    }
    if let Some(node) = &cli.node_version {
        overrides.set("node-version", node.clone());
    }

    let json = cli.json;
    let config = config::load(&cwd, overrides).map_err(|e| commands::fail(&e, json))?;
    let service = CacheService::new(config).map_err(|e| commands::fail(&e, json))?;

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Version => commands::version::run(json),
            Commands::Cache { cache_cmd } => match cache_cmd {
                CacheCommands::Add { specs } => {
                    commands::cache::add(&service, &cwd, &specs, json).await
                }
                CacheCommands::Ls { prefix } => commands::cache::ls(&service, prefix.as_deref(), json),
                CacheCommands::Clean { target } => {
                    commands::cache::clean(&service, target.as_deref(), json)
                }
                CacheCommands::Read { name, version } => {
                    commands::cache::read(&service, &name, &version, json).await
                }
            },
            Commands::View { spec } => commands::view::run(&service, &cwd, &spec, json).await,
            Commands::UpdateIndex { staleness } => {
                commands::index::run(&service, staleness, json).await
            }
        }
    })
}
