//! CLI mode for romfetch - browse and download from the command line.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use console::style;

use crate::batch::BatchCoordinator;
use crate::catalog::{RemoteFileEntry, list_platforms, search};
use crate::config::AppConfig;
use crate::connection::Session;
use crate::format::format_bytes;
use crate::memory::SessionMemory;
use crate::transfer::TransferEngine;

pub use progress::CliProgress;
use progress::{print_file_list, print_summary};

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List platform directories.
    Platforms,
    /// List files of a platform matching a query.
    Search { platform: String, query: String },
    /// Download the single match, or every match with `all`.
    Get {
        platform: String,
        query: String,
        all: bool,
    },
    /// Remove temporaries left by interrupted downloads.
    Purge,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Explicit config file, instead of the default location.
    pub config_path: Option<PathBuf>,
    /// Command to run.
    pub command: Command,
}

/// Parses arguments (without the program name).
///
/// Returns `Ok(None)` when help was requested or no command was given.
///
/// # Errors
///
/// Returns a message describing the first invalid argument.
pub fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut config_path = None;
    let mut all = false;
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Ok(None),
            "-c" | "--config" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a value")?;
                config_path = Some(PathBuf::from(value));
            }
            "-a" | "--all" => all = true,
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(format!("unknown option: {flag}"));
            }
            word => positional.push(word.to_string()),
        }
        i += 1;
    }

    let mut words = positional.into_iter();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let command = match name.as_str() {
        "platforms" => Command::Platforms,
        "purge" => Command::Purge,
        "search" => Command::Search {
            platform: words.next().ok_or("search requires a platform")?,
            query: words.collect::<Vec<_>>().join(" "),
        },
        "get" => {
            let platform = words.next().ok_or("get requires a platform")?;
            let query = words.collect::<Vec<_>>().join(" ");
            if query.trim().is_empty() && !all {
                return Err("get requires a query (or --all)".to_string());
            }
            Command::Get {
                platform,
                query,
                all,
            }
        }
        other => return Err(format!("unknown command: {other}")),
    };
    if all && !matches!(command, Command::Get { .. }) {
        return Err("--all only applies to get".to_string());
    }

    Ok(Some(Options {
        config_path,
        command,
    }))
}

/// Picks the file `get` downloads without `--all`: an exact name match,
/// otherwise the only match.
fn pick_single<'a>(hits: &'a [RemoteFileEntry], query: &str) -> Option<&'a RemoteFileEntry> {
    let query = query.trim();
    hits.iter()
        .find(|e| e.name.eq_ignore_ascii_case(query))
        .or(match hits {
            [only] => Some(only),
            _ => None,
        })
}

fn remember(platform: &str, query: &str) {
    let path = SessionMemory::default_path();
    let mut memory = SessionMemory::load(&path);
    memory.remember(platform, query);
    if let Err(e) = memory.save(&path) {
        log::warn!("Could not save {}: {e}", path.display());
    }
}

/// Runs one CLI command.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the connection
/// fails or a catalog request fails. Individual transfer failures are
/// reported in the summary, not as an error.
pub async fn run(options: Options) -> crate::Result<()> {
    let config = AppConfig::load(options.config_path.as_deref())?;

    if options.command == Command::Purge {
        let engine = TransferEngine::new(config.download.clone());
        let removed = engine.purge_orphans().await?;
        for path in &removed {
            println!("  removed {}", path.display());
        }
        println!("{} orphaned file(s) removed.", removed.len());
        return Ok(());
    }

    let connection = config.connection_config()?;
    println!("Connecting to {}...", connection.address());
    let session = Session::connect(connection).await?;
    run_connected(session, &config, options.command).await
}

/// Runs a remote command and closes the session whatever the outcome.
async fn run_connected(
    session: Session,
    config: &AppConfig,
    command: Command,
) -> crate::Result<()> {
    let result = execute(&session, config, command).await;
    session.close().await;
    result
}

async fn execute(session: &Session, config: &AppConfig, command: Command) -> crate::Result<()> {
    match command {
        Command::Platforms => show_platforms(session).await,
        Command::Search { platform, query } => {
            let hits = search(session, &platform, &query).await?;
            remember(&platform, &query);
            print_file_list(&platform, &hits);
            Ok(())
        }
        Command::Get {
            platform,
            query,
            all,
        } => {
            let hits = search(session, &platform, &query).await?;
            remember(&platform, &query);
            let selected = if all {
                hits
            } else if let Some(entry) = pick_single(&hits, &query) {
                vec![entry.clone()]
            } else {
                print_file_list(&platform, &hits);
                if !hits.is_empty() {
                    eprintln!("Several files match; refine the query or pass --all.");
                }
                Vec::new()
            };
            download(session, config, selected).await;
            Ok(())
        }
        Command::Purge => Ok(()),
    }
}

async fn show_platforms(session: &Session) -> crate::Result<()> {
    let last = SessionMemory::load(&SessionMemory::default_path()).last_platform;
    for platform in list_platforms(session).await? {
        if last.as_deref() == Some(platform.name.as_str()) {
            println!("  {} {}", style("*").cyan(), style(&platform.name).bold());
        } else {
            println!("    {}", platform.name);
        }
    }
    Ok(())
}

async fn download(session: &Session, config: &AppConfig, selected: Vec<RemoteFileEntry>) {
    if selected.is_empty() {
        return;
    }

    let total: u64 = selected.iter().map(|e| e.size).sum();
    println!(
        "Downloading {} file(s), {} total\n",
        selected.len(),
        format_bytes(total)
    );

    let progress = Arc::new(CliProgress::new((selected.len() > 1).then_some(total)));
    let engine = TransferEngine::new(config.download.clone()).with_progress(progress.clone());
    let requests = selected.into_iter().map(|e| engine.request(e)).collect();
    let coordinator = BatchCoordinator::new(engine);

    let handle = coordinator.run_batch(session, requests);
    let mut rx = handle.subscribe();
    tokio::select! {
        _ = rx.wait_for(|s| s.status.is_terminal()) => {}
        signal = tokio::signal::ctrl_c() => {
            if signal.is_ok() {
                log::info!("Received SIGINT, cancelling");
                handle.cancel();
            }
        }
    }

    let summary = handle.wait().await;
    progress.finish();
    print_summary(&summary);
}
