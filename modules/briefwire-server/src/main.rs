mod logstream;
mod routes;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ai_client::{Gateway, OpenAiTransport};
use briefwire_agents::{Curator, CuratorSettings};
use briefwire_archive::{ArticleStore, InformationStore};
use briefwire_common::{AnalysisMode, Config};
use briefwire_engine::{
    DigestBuilder, Notifier, Orchestrator, Runner, RunnerSettings, Scheduler, SmtpMailer,
};
use briefwire_graph::EntityStore;
use briefwire_index::{HashedIndex, VectorIndex};
use briefwire_scout::{Fetcher, FetcherSettings, FeedRegistry};
use briefwire_telemetry::Recorder;
use logstream::LogBroadcastLayer;
use routes::AppState;

#[derive(Parser)]
#[command(name = "briefwire", about = "RSS-to-digest analysis pipeline")]
struct Cli {
    /// Path to the config TOML file.
    #[arg(long, global = true, default_value = "briefwire.toml")]
    config: PathBuf,

    /// Path to the feeds TOML file.
    #[arg(long, global = true, default_value = "feeds.toml")]
    feeds: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline: scheduled service by default.
    Run {
        /// Single fetch-analyze-digest cycle, then exit.
        #[arg(long)]
        once: bool,
        /// Cap the number of articles analyzed per cycle.
        #[arg(long)]
        limit: Option<usize>,
        /// Execute the pipeline but skip SMTP delivery.
        #[arg(long)]
        dry_run: bool,
        /// Analysis depth: quick, standard, or deep.
        #[arg(long, default_value = "standard")]
        mode: String,
        /// Override configured analysis concurrency.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Also expose the admin HTTP/WebSocket surface.
        #[arg(long)]
        web: bool,
        /// Use the legacy article-centric pipeline instead of
        /// information units.
        #[arg(long)]
        article_centric: bool,
    },
    /// Manage the feed catalog.
    Feeds {
        #[command(subcommand)]
        action: FeedsAction,
    },
    /// Inspect the AI call telemetry log.
    Telemetry {
        #[command(subcommand)]
        action: TelemetryAction,
    },
}

#[derive(Subcommand)]
enum FeedsAction {
    /// List all feeds.
    List,
    /// Add a feed.
    Add {
        name: String,
        url: String,
        #[arg(default_value = "")]
        category: String,
    },
    /// Remove a feed by exact name or URL.
    Remove { identifier: String },
    /// Enable a feed by exact name or URL.
    Enable { identifier: String },
    /// Disable a feed by exact name or URL.
    Disable { identifier: String },
    /// Probe a URL and check it parses as RSS/Atom.
    Validate { url: String },
}

#[derive(Subcommand)]
enum TelemetryAction {
    /// Token and call totals, grouped by type, agent, and model.
    Aggregate,
    /// Recent calls, newest first.
    Calls {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Recent sessions.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Export matching full records as JSONL.
    Export {
        path: PathBuf,
        #[arg(long)]
        session: Option<String>,
    },
    /// Delete shards older than the configured retention.
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (log_layer, logs_tx) = LogBroadcastLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(log_layer)
        .init();

    match cli.command {
        Command::Feeds { action } => run_feeds_command(&cli.feeds, action).await,
        Command::Telemetry { action } => {
            let config = Config::load(&cli.config)?;
            run_telemetry_command(&config, action).await
        }
        Command::Run {
            once,
            limit,
            dry_run,
            mode,
            concurrency,
            web,
            article_centric,
        } => {
            // Fatal configuration fails fast, before any scheduling starts.
            let config = Config::load(&cli.config)?;
            let mode = AnalysisMode::from_str(&mode).map_err(|e| anyhow::anyhow!(e))?;
            let options = RunOptions {
                once,
                limit,
                dry_run,
                mode,
                concurrency,
                web,
                article_centric,
            };
            run_service(config, &cli.feeds, options, logs_tx).await
        }
    }
}

async fn run_feeds_command(feeds_path: &PathBuf, action: FeedsAction) -> Result<()> {
    let registry = FeedRegistry::load(feeds_path)?;
    match action {
        FeedsAction::List => {
            for feed in registry.list().await {
                println!(
                    "{} {} [{}] {}",
                    if feed.enabled { "on " } else { "off" },
                    feed.name,
                    feed.category,
                    feed.url
                );
            }
        }
        FeedsAction::Add {
            name,
            url,
            category,
        } => {
            registry.add(&name, &url, &category).await?;
            println!("added {name}");
        }
        FeedsAction::Remove { identifier } => {
            let removed = registry.remove(&identifier).await?;
            println!("removed {}", removed.name);
        }
        FeedsAction::Enable { identifier } => {
            registry.set_enabled(&identifier, true).await?;
            println!("enabled {identifier}");
        }
        FeedsAction::Disable { identifier } => {
            registry.set_enabled(&identifier, false).await?;
            println!("disabled {identifier}");
        }
        FeedsAction::Validate { url } => {
            if registry.validate(&url).await {
                println!("ok: {url} parses as RSS/Atom");
            } else {
                println!("failed: {url} is not a readable feed");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn run_telemetry_command(config: &Config, action: TelemetryAction) -> Result<()> {
    let recorder = Recorder::open(&config.telemetry.storage_path).await?;
    match action {
        TelemetryAction::Aggregate => {
            let report = recorder.aggregate(None, None, None).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        TelemetryAction::Calls {
            session,
            agent,
            limit,
        } => {
            let filter = briefwire_telemetry::CallFilter {
                session_id: session,
                agent_name: agent,
                ..Default::default()
            };
            for call in recorder.query(&filter, limit, 0).await? {
                println!(
                    "{} {} {} {} tokens={} {}ms{}",
                    call.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    call.call_type,
                    call.agent_name,
                    call.session_id,
                    call.total_tokens,
                    call.duration_ms,
                    call.error.map(|e| format!(" error={e}")).unwrap_or_default(),
                );
            }
        }
        TelemetryAction::Sessions { limit } => {
            for session in recorder.list_sessions(limit).await? {
                println!(
                    "{} calls={} tokens={} last={}",
                    session.session_id,
                    session.calls,
                    session.total_tokens,
                    session.last_call.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        TelemetryAction::Export { path, session } => {
            let filter = briefwire_telemetry::CallFilter {
                session_id: session,
                ..Default::default()
            };
            let count = recorder.export_jsonl(&path, &filter).await?;
            println!("exported {count} records to {}", path.display());
        }
        TelemetryAction::Cleanup => {
            let deleted = recorder.cleanup(config.telemetry.retention_days).await?;
            println!("deleted {deleted} index rows past retention");
        }
    }
    Ok(())
}

struct RunOptions {
    once: bool,
    limit: Option<usize>,
    dry_run: bool,
    mode: AnalysisMode,
    concurrency: Option<usize>,
    web: bool,
    article_centric: bool,
}

async fn run_service(
    config: Config,
    feeds_path: &PathBuf,
    options: RunOptions,
    logs_tx: tokio::sync::broadcast::Sender<String>,
) -> Result<()> {
    let RunOptions {
        once,
        limit,
        dry_run,
        mode,
        concurrency,
        web,
        article_centric,
    } = options;
    tracing::info!(mode = mode.as_str(), once, dry_run, "Starting briefwire");

    // Stores.
    let pool = briefwire_archive::connect(std::path::Path::new(&config.storage.database_path))
        .await?;
    let articles = ArticleStore::new(pool.clone());
    let index: Arc<dyn VectorIndex> = Arc::new(HashedIndex::new());
    let units = InformationStore::new(pool.clone(), index.clone());
    let entities = EntityStore::new(pool.clone());
    entities.init().await?;

    // Telemetry sink behind the gateway.
    let recorder = if config.telemetry.enabled {
        Some(Arc::new(
            Recorder::open(&config.telemetry.storage_path).await?,
        ))
    } else {
        None
    };

    let transport = Arc::new(OpenAiTransport::new(
        config.ai.api_key.clone(),
        config.ai.base_url.clone(),
    ));
    let mut gateway = Gateway::new(transport, config.ai.model.clone())
        .with_defaults(config.ai.max_tokens, config.ai.temperature)
        .with_max_content_length(config.telemetry.max_content_length);
    if let Some(recorder) = &recorder {
        gateway = gateway.with_sink(recorder.clone());
    }
    let gateway = Arc::new(gateway);

    let registry = Arc::new(FeedRegistry::load(feeds_path)?);
    let fetcher = Fetcher::new(FetcherSettings {
        max_concurrent_fetches: config.concurrency.max_concurrent_fetches,
        max_concurrent_extractions: config.concurrency.max_concurrent_extractions,
        retention_days: config.storage.article_retention_days,
    });

    let data_dir = std::path::Path::new(&config.storage.database_path)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"));

    let orchestrator = Arc::new(Orchestrator::new(
        gateway.clone(),
        index.clone(),
        units.clone(),
        Some(entities.clone()),
        mode,
        config.l3_roots(),
        Some(data_dir.join("analysis")),
    ));

    let curator = Curator::new(
        gateway.clone(),
        CuratorSettings {
            top_pick_count: config.filter.top_pick_count,
            min_score: config.filter.min_score,
            max_quick_reads: config.filter.max_articles_per_digest,
        },
    );

    let notifier = if config.email.smtp_host.is_empty() || config.email.to_addrs.is_empty() {
        tracing::info!("Email not configured, digests will not be delivered");
        None
    } else {
        let mailer = SmtpMailer::new(&config.email)?;
        Some(Notifier::new(Box::new(mailer), config.email.clone()))
    };

    let runner = Arc::new(Runner::new(
        registry.clone(),
        fetcher,
        articles.clone(),
        orchestrator,
        DigestBuilder::new(units.clone()),
        curator,
        notifier,
        RunnerSettings {
            max_concurrent_analyses: concurrency
                .unwrap_or(config.concurrency.max_concurrent_analyses),
            article_centric,
        },
    ));

    let cancel = CancellationToken::new();

    // Admin surface, when requested.
    let server_handle = if web {
        let state = AppState {
            runner: runner.clone(),
            registry: registry.clone(),
            articles: articles.clone(),
            entities: entities.clone(),
            recorder: recorder.clone(),
            mode: mode.as_str().to_string(),
            logs_tx,
            progress_tx: tokio::sync::broadcast::channel(256).0,
            ws_connections: Arc::new(AtomicUsize::new(0)),
        };
        let router = routes::build_router(state, &config.server.allowed_origins);
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind admin surface on {addr}"))?;
        tracing::info!(addr, "Admin surface listening");

        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        }))
    } else {
        None
    };

    if once {
        let stats = runner.run_cycle(limit).await?;
        tracing::info!(
            fetched = stats.fetched,
            analyzed = stats.analyzed,
            units = stats.units_emitted,
            "Single cycle complete"
        );
        let sent = runner.run_digest(dry_run).await?;
        tracing::info!(sent, "Digest pass complete");
        cancel.cancel();
        if let Some(handle) = server_handle {
            let _ = handle.await;
        }
        return Ok(());
    }

    // Scheduled service.
    let mut scheduler = Scheduler::new(cancel.clone());

    let fetch_runner = runner.clone();
    scheduler.every("fetch-cycle", config.fetch_interval(), move || {
        let runner = fetch_runner.clone();
        async move {
            runner.run_cycle(limit).await?;
            Ok(())
        }
    });

    let digest_runner = runner.clone();
    let tz = config.timezone()?;
    scheduler.daily_at("digest", config.digest_times(), tz, move || {
        let runner = digest_runner.clone();
        async move {
            runner.run_digest(dry_run).await?;
            Ok(())
        }
    });

    // Daily retention sweeps for articles and telemetry.
    let sweep_articles = articles.clone();
    let sweep_units = units.clone();
    let retention_days = config.storage.article_retention_days;
    let telemetry_retention = config.telemetry.retention_days;
    let sweep_recorder = recorder.clone();
    scheduler.every(
        "retention-sweep",
        std::time::Duration::from_secs(24 * 3600),
        move || {
            let articles = sweep_articles.clone();
            let units = sweep_units.clone();
            let recorder = sweep_recorder.clone();
            async move {
                articles.cleanup(retention_days).await?;
                units.cleanup(retention_days).await?;
                if let Some(recorder) = recorder {
                    recorder.cleanup(telemetry_retention).await?;
                }
                Ok(())
            }
        },
    );

    tracing::info!("Scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    tracing::info!("Shutdown requested, letting in-flight work finish");
    cancel.cancel();
    scheduler.join().await;
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }
    tracing::info!("Clean shutdown");
    Ok(())
}
