//! Focal CLI - collect tweets around a focal event.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use focal::backfill::{BackfillOrchestrator, BackfillOrder};
use focal::config::{CollectorConfig, EventConfig, DEFAULT_CONFIG_PATH};
use focal::merge::MergeStage;
use focal::resolvers::{self, ConversationResolver, QuoteResolver, ResolveMode, TimelineResolver};
use focal::rules::{RuleManager, RuleMode};
use focal::search::{query_window, CountSink, SearchCollector, SearchJob, SearchMode};
use focal::store::{JsonFileStore, Store};
use focal::stream::{StreamCollector, StreamOutcome};
use focal::summary::RunSummary;
use focal::twitter::{
    EndpointKind, Granularity, RulesApi, SearchApi, StreamSource, TimelineApi, TwitterClient,
};
use focal::window::{TimeAnchor, TimeWindow};
use focal::{CollectorError, SourceMethod};

/// Focal CLI - search, stream and resolve tweets around focal events.
#[derive(Parser)]
#[command(name = "focal")]
#[command(about = "Focal-event tweet collection")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file
    #[arg(short, long, global = true, env = "FOCAL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconcile stream rules with the configured set
    Rules {
        /// Report the diff without changing anything
        #[arg(long, conflicts_with = "validate_only")]
        dry_run: bool,

        /// Syntax-check new rules without keeping them
        #[arg(long)]
        validate_only: bool,
    },

    /// Collect from the filtered stream
    Stream {
        /// Event name
        event: String,

        /// Stop after this many minutes (overrides the config)
        #[arg(long)]
        minutes: Option<u64>,
    },

    /// Run the event's configured search queries
    Search {
        /// Event name
        event: String,

        /// Search from the latest collected tweet up to now
        #[arg(long, conflicts_with = "backfill")]
        update: bool,

        /// Search the day before the earliest collected tweet
        #[arg(long)]
        backfill: bool,

        /// Use recent search instead of the full archive
        #[arg(long)]
        recent: bool,

        /// Tally pulled results per this many minutes
        #[arg(long)]
        count_interval: Option<u32>,
    },

    /// Count matching tweets without collecting them
    Counts {
        /// Event name
        event: String,

        #[arg(long, value_enum, default_value_t = Granularity::Hour)]
        granularity: Granularity,

        /// Use recent counts instead of the full archive
        #[arg(long)]
        recent: bool,
    },

    /// Pull the conversations of collected tweets
    Convos {
        /// Event name
        event: String,

        #[command(flatten)]
        resolve: ResolveArgs,
    },

    /// Pull quote tweets of collected tweets
    Quotes {
        /// Event name
        event: String,

        /// Window start (first_time, last_time, now or RFC-3339)
        #[arg(long)]
        start: Option<TimeAnchor>,

        /// Window end (first_time, last_time, now or RFC-3339)
        #[arg(long)]
        end: Option<TimeAnchor>,

        /// Quote-of-quote depth (overrides the config)
        #[arg(long)]
        depth: Option<u32>,

        /// Use recent search instead of the full archive
        #[arg(long)]
        recent: bool,
    },

    /// Pull timelines of the authors of collected tweets
    Timelines {
        /// Event name
        event: String,

        #[command(flatten)]
        resolve: ResolveArgs,

        /// Fetch whole timelines, ignoring the window
        #[arg(long, conflicts_with_all = ["start", "end"])]
        full: bool,
    },

    /// Fill the uncovered parts of a historical range
    Backfill {
        /// Event name
        event: String,

        /// Range start (first_time, last_time, now or RFC-3339)
        #[arg(long)]
        start: TimeAnchor,

        /// Range end (first_time, last_time, now or RFC-3339)
        #[arg(long)]
        end: TimeAnchor,

        /// Search the newest windows first
        #[arg(long)]
        newest_first: bool,

        /// Use recent search instead of the full archive
        #[arg(long)]
        recent: bool,
    },
}

/// Options shared by the conversation and timeline resolvers.
#[derive(clap::Args)]
pub struct ResolveArgs {
    /// Newline-delimited ids to resolve instead of the collected ones
    #[arg(long)]
    ids_file: Option<PathBuf>,

    /// Start each id at its latest known tweet
    #[arg(long, conflicts_with = "backfill")]
    update: bool,

    /// End each id at its earliest known tweet
    #[arg(long)]
    backfill: bool,

    /// Window start (first_time, last_time, now or RFC-3339)
    #[arg(long)]
    start: Option<TimeAnchor>,

    /// Window end (first_time, last_time, now or RFC-3339)
    #[arg(long)]
    end: Option<TimeAnchor>,

    /// Use recent search instead of the full archive
    #[arg(long)]
    recent: bool,
}

impl ResolveArgs {
    fn mode(&self) -> ResolveMode {
        if self.update {
            ResolveMode::Update
        } else if self.backfill {
            ResolveMode::Backfill
        } else {
            ResolveMode::Standard
        }
    }
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Rules { .. } => "rules",
            Self::Stream { .. } => "stream",
            Self::Search { .. } => "search",
            Self::Counts { .. } => "counts",
            Self::Convos { .. } => "convos",
            Self::Quotes { .. } => "quotes",
            Self::Timelines { .. } => "timelines",
            Self::Backfill { .. } => "backfill",
        }
    }

    fn event(&self) -> Option<&str> {
        match self {
            Self::Rules { .. } => None,
            Self::Stream { event, .. }
            | Self::Search { event, .. }
            | Self::Counts { event, .. }
            | Self::Convos { event, .. }
            | Self::Quotes { event, .. }
            | Self::Timelines { event, .. }
            | Self::Backfill { event, .. } => Some(event),
        }
    }
}

fn endpoint(recent: bool) -> EndpointKind {
    if recent {
        EndpointKind::Recent
    } else {
        EndpointKind::FullArchive
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for the summary
    let filter = if cli.verbose {
        EnvFilter::new("focal=debug,info")
    } else {
        EnvFilter::new("focal=info,warn")
    };
    let (plain, json) = if cli.json_logs {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };
    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(filter)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current page");
            on_signal.cancel();
        }
    });

    let mut summary = RunSummary::new(cli.command.name(), cli.command.event());
    if let Err(e) = run(&cli, cancel, &mut summary).await {
        tracing::error!(error = %format!("{e:#}"), "Run failed");
        match e.downcast_ref::<CollectorError>() {
            Some(collector_error) => summary.record_error(collector_error),
            None => summary.record_fatal(&e),
        }
    }

    let code = summary.finish();
    match summary.to_json() {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "Failed to render summary"),
    }
    code
}

/// Loaded configuration, API client and store for one run.
struct Session {
    config: CollectorConfig,
    client: Arc<TwitterClient>,
    store: Arc<JsonFileStore>,
    cancel: CancellationToken,
}

impl Session {
    async fn open(path: &Path, cancel: CancellationToken) -> Result<Self> {
        let config = CollectorConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        let token = config.bearer_token()?;
        let client = TwitterClient::new(&config.api, token).context("failed to build API client")?;
        let store = JsonFileStore::open(config.store.path.clone())
            .await
            .with_context(|| format!("failed to open store {}", config.store.path.display()))?;
        Ok(Self {
            config,
            client: Arc::new(client),
            store: Arc::new(store),
            cancel,
        })
    }

    fn event(&self, name: &str) -> Result<EventConfig> {
        Ok(self.config.event(name)?.clone())
    }

    fn merge(&self, event: &str) -> Arc<MergeStage> {
        let store: Arc<dyn Store> = self.store.clone();
        Arc::new(MergeStage::new(store, event))
    }

    fn search(&self, merge: Arc<MergeStage>, endpoint: EndpointKind) -> SearchCollector {
        let api: Arc<dyn SearchApi> = self.client.clone();
        SearchCollector::new(
            api,
            merge,
            self.config.search.limits(endpoint),
            self.config.paginator.policy(Some(endpoint)),
            self.config.api.page_size(endpoint),
            self.cancel.clone(),
        )
    }
}

async fn run(cli: &Cli, cancel: CancellationToken, summary: &mut RunSummary) -> Result<()> {
    let session = Session::open(&cli.config, cancel).await?;

    match &cli.command {
        Commands::Rules {
            dry_run,
            validate_only,
        } => {
            let mode = if *dry_run {
                RuleMode::DryRun
            } else if *validate_only {
                RuleMode::ValidateOnly
            } else {
                RuleMode::Apply
            };
            run_rules(&session, mode, summary).await
        }
        Commands::Stream { event, minutes } => {
            tracing::info!(event, ?minutes, "Starting stream collection");
            run_stream(&session, event, *minutes, summary).await
        }
        Commands::Search {
            event,
            update,
            backfill,
            recent,
            count_interval,
        } => {
            let mode = if *update {
                SearchMode::Update
            } else if *backfill {
                SearchMode::Backfill
            } else {
                SearchMode::Standard
            };
            tracing::info!(event, ?mode, recent, "Starting search");
            run_search(&session, event, mode, endpoint(*recent), *count_interval, summary).await
        }
        Commands::Counts {
            event,
            granularity,
            recent,
        } => run_counts(&session, event, *granularity, endpoint(*recent), summary).await,
        Commands::Convos { event, resolve } => run_convos(&session, event, resolve, summary).await,
        Commands::Quotes {
            event,
            start,
            end,
            depth,
            recent,
        } => {
            let depth = depth.unwrap_or(session.config.search.quote_max_depth);
            run_quotes(&session, event, *start, *end, depth, endpoint(*recent), summary).await
        }
        Commands::Timelines {
            event,
            resolve,
            full,
        } => run_timelines(&session, event, resolve, *full, summary).await,
        Commands::Backfill {
            event,
            start,
            end,
            newest_first,
            recent,
        } => {
            let order = if *newest_first {
                BackfillOrder::NewestFirst
            } else {
                BackfillOrder::OldestFirst
            };
            run_backfill(&session, event, *start, *end, order, endpoint(*recent), summary).await
        }
    }
}

async fn run_rules(session: &Session, mode: RuleMode, summary: &mut RunSummary) -> Result<()> {
    let api: Arc<dyn RulesApi> = session.client.clone();
    let desired = session.config.stream_rules();
    let report = RuleManager::new(api).reconcile(&desired, mode).await?;
    summary.push_detail(&report);
    Ok(())
}

async fn run_stream(
    session: &Session,
    name: &str,
    minutes: Option<u64>,
    summary: &mut RunSummary,
) -> Result<()> {
    let event = session.event(name)?;
    let merge = session.merge(&event.name);
    let mut policy = session.config.stream.policy();
    if let Some(minutes) = minutes {
        policy.duration = Some(std::time::Duration::from_secs(minutes.saturating_mul(60)));
    }

    let source: Arc<dyn StreamSource> = session.client.clone();
    let mut collector = StreamCollector::new(source, Arc::clone(&merge), policy, session.cancel.clone())
        .with_rule_tags(event.rules.keys().cloned());
    let result = collector.run().await;
    summary.set_counts(&merge.counts().await);

    let report = result?;
    summary.push_detail(&report);
    if report.outcome == Some(StreamOutcome::Cancelled) {
        tracing::info!("Stream stopped by interrupt");
    }
    Ok(())
}

async fn run_search(
    session: &Session,
    name: &str,
    mode: SearchMode,
    endpoint: EndpointKind,
    count_interval: Option<u32>,
    summary: &mut RunSummary,
) -> Result<()> {
    let event = session.event(name)?;
    let merge = session.merge(&event.name);
    let sink = count_interval.map(|m| Arc::new(CountSink::new(chrono::Duration::minutes(i64::from(m.max(1))))));
    let mut search = session.search(Arc::clone(&merge), endpoint);
    if let Some(sink) = &sink {
        search = search.with_count_sink(Arc::clone(sink));
    }

    let span = session
        .store
        .span(&event.name, &[SourceMethod::Search, SourceMethod::Stream])
        .await?;
    let now = Utc::now();

    let mut outcome = Ok(());
    for query in &event.queries {
        let window = query_window(query, mode, span, search.limits(), now)
            .with_context(|| format!("cannot resolve window for query '{}'", query.query))?;
        let job = SearchJob {
            query: query.query.clone(),
            window,
            ceiling: query.max_results,
            source: SourceMethod::Search,
        };
        let mut result = search.run(&job).await;
        let resume_from = match &result {
            Err(e) if e.is_resumable() => e.cursor().cloned(),
            _ => None,
        };
        if let Some(cursor) = resume_from {
            tracing::warn!(query = %job.query, collected = cursor.collected, "Search failed, resuming from its cursor");
            result = search.resume(&job, cursor).await;
        }
        match result {
            Ok(report) => {
                summary.push_detail(&report);
                if report.cancelled {
                    summary.mark_partial(format!("search '{}' interrupted", job.query));
                    break;
                }
            }
            Err(e) if e.is_resumable() => summary.record_error(&e),
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    summary.set_counts(&merge.counts().await);
    if let Some(sink) = sink {
        summary.push_detail(&serde_json::json!({ "count_sink": sink.snapshot().await }));
    }
    outcome?;
    Ok(())
}

async fn run_counts(
    session: &Session,
    name: &str,
    granularity: Granularity,
    endpoint: EndpointKind,
    summary: &mut RunSummary,
) -> Result<()> {
    let event = session.event(name)?;
    let search = session.search(session.merge(&event.name), endpoint);
    let span = session
        .store
        .span(&event.name, &[SourceMethod::Search, SourceMethod::Stream])
        .await?;
    let now = Utc::now();

    for query in &event.queries {
        let window = query_window(query, SearchMode::Standard, span, search.limits(), now)?;
        let report = search.counts(&query.query, window, granularity).await?;
        summary.push_detail(&serde_json::json!({
            "query": query.query,
            "window": window,
            "counts": report,
        }));
    }
    Ok(())
}

async fn resolver_window(
    session: &Session,
    event: &str,
    start: Option<TimeAnchor>,
    end: Option<TimeAnchor>,
    days_back: i64,
) -> Result<TimeWindow> {
    let days_back = if start.is_some() { 0 } else { days_back };
    let window = resolvers::anchored_window(
        session.store.as_ref(),
        event,
        start.unwrap_or(TimeAnchor::FirstTime),
        end.unwrap_or(TimeAnchor::LastTime),
        days_back,
        Utc::now(),
    )
    .await
    .context("cannot resolve resolver window; pass --start and --end")?;
    Ok(window)
}

async fn run_convos(
    session: &Session,
    name: &str,
    args: &ResolveArgs,
    summary: &mut RunSummary,
) -> Result<()> {
    let event = session.event(name)?;
    let targets = match args.ids_file.as_deref() {
        Some(path) => resolvers::read_ids(path).await?,
        None => resolvers::conversation_targets(session.store.as_ref(), &event.name).await?,
    };
    let window = resolver_window(session, &event.name, args.start, args.end, 0).await?;

    let merge = session.merge(&event.name);
    let search = session.search(Arc::clone(&merge), endpoint(args.recent));
    let result = ConversationResolver::new(&search)
        .run(&targets, window, args.mode())
        .await;
    finish_resolver(summary, &merge, result).await
}

async fn run_quotes(
    session: &Session,
    name: &str,
    start: Option<TimeAnchor>,
    end: Option<TimeAnchor>,
    depth: u32,
    endpoint: EndpointKind,
    summary: &mut RunSummary,
) -> Result<()> {
    let event = session.event(name)?;
    let seeds = resolvers::quote_targets(session.store.as_ref(), &event.name).await?;
    let window = resolver_window(session, &event.name, start, end, 0).await?;

    let merge = session.merge(&event.name);
    let search = session.search(Arc::clone(&merge), endpoint);
    let result = QuoteResolver::new(&search, depth).run(&seeds, window).await;
    finish_resolver(summary, &merge, result).await
}

async fn run_timelines(
    session: &Session,
    name: &str,
    args: &ResolveArgs,
    full: bool,
    summary: &mut RunSummary,
) -> Result<()> {
    let event = session.event(name)?;
    let targets = match args.ids_file.as_deref() {
        Some(path) => resolvers::read_ids(path).await?,
        None => resolvers::timeline_targets(session.store.as_ref(), &event.name).await?,
    };
    let window = if full {
        None
    } else {
        let days_back = session.config.search.timeline_days_back;
        Some(resolver_window(session, &event.name, args.start, args.end, days_back).await?)
    };

    let merge = session.merge(&event.name);
    let api: Arc<dyn TimelineApi> = session.client.clone();
    let resolver = TimelineResolver::new(
        api,
        Arc::clone(&merge),
        session.config.paginator.policy(None),
        session.config.api.timeline_page_size,
        session.cancel.clone(),
    );
    let result = resolver.run(&targets, window, args.mode()).await;
    finish_resolver(summary, &merge, result).await
}

async fn finish_resolver(
    summary: &mut RunSummary,
    merge: &MergeStage,
    result: focal::CollectorResult<resolvers::ResolverReport>,
) -> Result<()> {
    summary.set_counts(&merge.counts().await);
    let report = result?;
    if report.cancelled {
        summary.mark_partial(format!("{} interrupted", report.relation));
    }
    summary.push_detail(&report);
    Ok(())
}

async fn run_backfill(
    session: &Session,
    name: &str,
    start: TimeAnchor,
    end: TimeAnchor,
    order: BackfillOrder,
    endpoint: EndpointKind,
    summary: &mut RunSummary,
) -> Result<()> {
    let event = session.event(name)?;
    let (query, ceiling) = match event.queries.as_slice() {
        [] => anyhow::bail!("event '{}' has no queries to backfill", event.name),
        [only] => (only.query.clone(), only.max_results),
        many => (
            many.iter()
                .map(|q| format!("({})", q.query))
                .collect::<Vec<_>>()
                .join(" OR "),
            None,
        ),
    };

    let span = session
        .store
        .span(&event.name, &[SourceMethod::Search, SourceMethod::Stream])
        .await?;
    let now = Utc::now();
    let requested = TimeWindow::new(start.resolve(span, now)?, end.resolve(span, now)?)?;

    let merge = session.merge(&event.name);
    let search = session.search(Arc::clone(&merge), endpoint);
    let orchestrator =
        BackfillOrchestrator::new(&search, session.config.search.backfill_window(), order);
    let result = orchestrator.run(&query, requested, ceiling).await;
    summary.set_counts(&merge.counts().await);

    let report = result?;
    for failure in &report.failures {
        summary.record_error(&CollectorError::from(failure.clone()));
    }
    if report.cancelled {
        summary.mark_partial("backfill interrupted");
    }
    summary.set_windows(report.completed.clone(), report.pending.clone());
    summary.push_detail(&report);
    Ok(())
}
