mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidings_engine::{
    Engine, EngineConfig, Event, EventQuery, JsonlEventStore, MAX_QUERY_LIMIT, MemoryEventStore,
    OrderBy, PatternFilter, ReplayOptions, ReplayState, SharedFilter,
};

use crate::config::Settings;

#[derive(Parser)]
#[command(
    name = "tidings",
    version,
    about = "Query and replay recorded event logs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print stored events as JSON lines
    Query {
        /// Event log (JSON lines)
        #[arg(long, short, env = "TIDINGS_INPUT")]
        input: PathBuf,
        /// Only events produced by this agent
        #[arg(long)]
        agent: Option<String>,
        /// Only events of these types (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Newest first
        #[arg(long)]
        desc: bool,
    },
    /// Re-publish a recorded log with its original pacing
    Replay {
        #[arg(long, short, env = "TIDINGS_INPUT")]
        input: PathBuf,
        /// Playback rate; 2.0 is twice as fast as recorded
        #[arg(long)]
        speed: Option<f64>,
        /// Only replay event types matching this pattern, e.g. `agent.*`
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Print engine statistics for a log
    Stats {
        #[arg(long, short, env = "TIDINGS_INPUT")]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::new().context("failed to load settings")?;

    // Logs go to stderr so stdout stays machine-readable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Query {
            input,
            agent,
            types,
            limit,
            offset,
            desc,
        } => {
            let engine = open_engine(&input, &settings.engine).await?;

            let mut query = engine
                .new_query()
                .with_types(types)
                .with_offset(offset)
                .ordered_by(OrderBy::Timestamp, desc);
            if let Some(agent) = agent {
                query = query.for_agent(agent);
            }
            if let Some(limit) = limit {
                query = query.with_limit(limit);
            }

            for event in engine.query(&query).await? {
                print_event(&engine, &event).await?;
            }
        }

        Commands::Replay {
            input,
            speed,
            pattern,
        } => {
            let engine = open_engine(&input, &settings.engine).await?;

            let mut options = ReplayOptions::new(speed.unwrap_or(settings.replay.default_speed));
            if let Some(pattern) = pattern {
                let filter: SharedFilter = Arc::new(PatternFilter::new(&pattern)?);
                options = options.with_filter(filter);
            }

            let mut stream = engine.create_stream_with_filter(None).await?;
            let stored = engine.store().count().await?;
            let mut emitted = 0;

            'pages: for query in replay_pages(stored) {
                let offset = query.offset;
                let id = engine.replay(query, options.clone()).await?;
                info!(session_id = %id, input = %input.display(), offset, "Replaying event log");

                loop {
                    tokio::select! {
                        event = stream.next() => match event {
                            Some(event) => print_event(&engine, &event).await?,
                            None => break 'pages,
                        },
                        status = engine.wait_replay(&id) => {
                            let status = status?;
                            // Flush whatever the stream still holds
                            while let Some(event) = stream.try_next() {
                                print_event(&engine, &event).await?;
                            }
                            emitted += status.emitted;
                            if status.state != ReplayState::Completed {
                                break 'pages;
                            }
                            break;
                        }
                        _ = tokio::signal::ctrl_c() => {
                            warn!(session_id = %id, "Interrupted, cancelling replay");
                            engine.cancel_replay(&id).await?;
                            break 'pages;
                        }
                    }
                }
                engine.prune_replays().await;
            }
            info!(emitted, stored, "Replay finished");

            let dropped = stream.stats().dropped;
            if dropped > 0 {
                warn!(dropped, "Output could not keep up with the replay");
            }
            engine.close().await;
        }

        Commands::Stats { input } => {
            let engine = open_engine(&input, &settings.engine).await?;
            let stats = engine.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

/// Engine over a JSON-lines log. The newest `store_capacity` events are kept
/// in memory.
async fn open_engine(input: &Path, config: &EngineConfig) -> Result<Engine> {
    let store = JsonlEventStore::open_with_index(
        input,
        MemoryEventStore::with_capacity(config.store_capacity),
    )
    .await
    .with_context(|| format!("failed to open event log {}", input.display()))?;

    Ok(Engine::with_store(config.clone(), Arc::new(store))?)
}

/// Queries covering `stored` events in order. Queries are capped, so long
/// logs are replayed page by page.
fn replay_pages(stored: usize) -> impl Iterator<Item = EventQuery> {
    (0..stored.max(1)).step_by(MAX_QUERY_LIMIT).map(|offset| {
        EventQuery::new()
            .with_offset(offset)
            .with_limit(MAX_QUERY_LIMIT)
    })
}

async fn print_event(engine: &Engine, event: &Event) -> Result<()> {
    let bytes = engine.serialize(event, "json").await?;
    println!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}
