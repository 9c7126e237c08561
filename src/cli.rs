//! CLI interface for collective-memory

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::io::Read;
use std::sync::Arc;

use crate::config::{self, Config};
use crate::tools::{execute_tool, Collective, ToolCall};

#[derive(Parser)]
#[command(name = "collective-memory")]
#[command(about = "Shared knowledge memory for coding agents, local-first with background sync", long_about = None)]
#[command(version)]
struct Cli {
    /// Print raw JSON results instead of markdown
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP tool server with background sync
    Serve {
        /// Port to listen on (default from config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind to (default from config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Search knowledge by free text
    Recall {
        query: String,
        /// solution, failure_pattern or gotcha
        #[arg(short, long)]
        kind: Option<String>,
        #[arg(short, long)]
        category: Option<String>,
        /// Required tag (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Look up an error; reads stdin when no text is given
    Intercept {
        error_text: Option<String>,
        /// What you were doing when it happened
        #[arg(long)]
        context: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Save a solution, gotcha or failure pattern
    Memorize {
        #[arg(short, long, default_value = "solution")]
        kind: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        #[arg(short, long, default_value = "general")]
        category: String,
        /// Code appended as a fenced block
        #[arg(long)]
        code: Option<String>,
        /// Id of the entry this replaces
        #[arg(long)]
        supersedes: Option<String>,
        /// Id of the problem this answers
        #[arg(long)]
        resolves: Option<String>,
    },
    /// Record an approach that did not work
    ReportFailure {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        tried: Option<String>,
        #[arg(long)]
        why_failed: Option<String>,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        alternative: Option<String>,
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },
    /// Known failure patterns for an approach
    KnownFailures {
        query: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Post a problem to the board unless knowledge already covers it
    Ask {
        problem: String,
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },
    /// Recent collective knowledge and open problems
    Trending {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Push pending entries and pull remote changes now
    Sync,
    /// Store, identity and sync health
    Status,
    /// Configure collective-memory
    Config(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Show current configuration
    #[arg(long)]
    show: bool,
    /// Store the collective API key
    #[arg(long)]
    set_api_key: Option<String>,
    /// Remove the stored API key
    #[arg(long)]
    clear_api_key: bool,
    /// Set the collective store endpoint
    #[arg(long)]
    set_base_url: Option<String>,
    #[arg(long)]
    enable_sync: bool,
    #[arg(long, conflicts_with = "enable_sync")]
    disable_sync: bool,
    /// Reset configuration to defaults
    #[arg(long)]
    reset: bool,
    /// Print the config file path
    #[arg(long)]
    path: bool,
}

fn open_collective(config: &Config) -> Result<Collective> {
    Collective::from_config(config, &config::config_dir()?)
}

/// Run a tool through the shared dispatcher and print its result
async fn run_tool(collective: &Collective, name: &str, arguments: serde_json::Value, as_json: bool) -> Result<()> {
    let result = execute_tool(&ToolCall { name: name.to_string(), arguments }, collective).await;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.message);
    }
    collective.shutdown()?;
    if !result.success {
        anyhow::bail!("{} failed", name);
    }
    Ok(())
}

fn run_config(args: ConfigArgs) -> Result<()> {
    if let Some(key) = args.set_api_key {
        config::set_api_key(&key)
    } else if args.clear_api_key {
        config::clear_api_key()
    } else if let Some(url) = args.set_base_url {
        config::set_base_url(&url)
    } else if args.enable_sync || args.disable_sync {
        config::set_sync_enabled(args.enable_sync)
    } else if args.reset {
        config::reset_config()
    } else if args.path {
        println!("{}", config::config_path()?.display());
        Ok(())
    } else if args.show {
        config::show_config()
    } else {
        println!("Default configuration:\n\n{}", config::default_config_toml());
        Ok(())
    }
}

fn read_stdin() -> Result<String> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text).context("Failed to read error text from stdin")?;
    Ok(text)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let as_json = cli.json;

    let command = match cli.command {
        Commands::Config(args) => return run_config(args),
        command => command,
    };

    let config = Config::load()?;
    let collective = open_collective(&config)?;

    match command {
        Commands::Serve { port, host } => {
            let mut server = config.server.clone();
            if let Some(port) = port {
                server.port = port;
            }
            if let Some(host) = host {
                server.host = host;
            }
            crate::server::serve(Arc::new(collective), &server).await?;
        }
        Commands::Recall { query, kind, category, tags, limit } => {
            let arguments = json!({ "query": query, "kind": kind, "category": category, "tags": tags, "limit": limit });
            run_tool(&collective, "recall", arguments, as_json).await?;
        }
        Commands::Intercept { error_text, context, limit } => {
            let error_text = match error_text {
                Some(text) => text,
                None => read_stdin()?,
            };
            let arguments = json!({ "error_text": error_text, "context": context, "limit": limit });
            run_tool(&collective, "intercept", arguments, as_json).await?;
        }
        Commands::Memorize { kind, title, content, tags, category, code, supersedes, resolves } => {
            let arguments = json!({
                "kind": kind,
                "title": title,
                "content": content,
                "tags": tags,
                "category": category,
                "code_example": code,
                "supersedes": supersedes,
                "resolves_problem": resolves,
            });
            run_tool(&collective, "memorize", arguments, as_json).await?;
        }
        Commands::ReportFailure { title, content, tried, why_failed, context, alternative, tags } => {
            let arguments = json!({
                "title": title,
                "content": content,
                "what_i_tried": tried,
                "why_it_failed": why_failed,
                "context": context,
                "better_alternative": alternative,
                "tags": tags,
            });
            run_tool(&collective, "report_failure", arguments, as_json).await?;
        }
        Commands::KnownFailures { query, limit } => {
            run_tool(&collective, "known_failures", json!({ "query": query, "limit": limit }), as_json).await?;
        }
        Commands::Ask { problem, tags } => {
            run_tool(&collective, "ask_community", json!({ "problem": problem, "tags": tags }), as_json).await?;
        }
        Commands::Trending { limit } => {
            run_tool(&collective, "whats_trending", json!({ "limit": limit }), as_json).await?;
        }
        Commands::Sync => {
            let report = collective.sync_now().await.context("Sync failed")?;
            collective.shutdown()?;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.disabled {
                println!("Sync is disabled. Enable it with `collective-memory config --enable-sync`.");
            } else {
                println!(
                    "Pushed {} entries and {} problems, pulled {} ({} new, {} unified, {} conflicts).",
                    report.pushed, report.problems_pushed, report.pulled, report.inserted, report.unified, report.conflicts
                );
                if report.skipped > 0 {
                    println!("Skipped {} malformed remote entries.", report.skipped);
                }
            }
        }
        Commands::Status => {
            let status = collective.status().await;
            if as_json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Instance:  {}", status.instance_id);
                println!("Snapshot:  {}", status.snapshot);
                println!("Entries:   {} ({} aliases)", status.store.entries, status.store.aliases);
                for (state, count) in &status.store.by_sync_state {
                    println!("  {:<12} {}", state, count);
                }
                println!("Problems:  {} ({} open)", status.store.problems, status.store.open_problems);
                if status.store.dirty {
                    println!("Warning: unsaved changes; the last write to disk failed.");
                }
                if let Some(sync) = status.sync {
                    println!("Sync:      {}{}", if sync.enabled { "enabled" } else { "disabled" }, if sync.anonymous { " (anonymous)" } else { "" });
                    if let Some(error) = sync.last_error {
                        println!("Last error: {}", error);
                    }
                }
            }
        }
        Commands::Config(args) => run_config(args)?,
    }

    Ok(())
}
