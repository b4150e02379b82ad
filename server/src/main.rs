//! Atoll binary — thin CLI shell over the [`atoll_server`] library crate.

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use atoll_core::types::{JobState, QueryRequest};
use atoll_server::api::{self, ApiState};
use atoll_server::config::Config;
use atoll_server::crawl::HttpPageFetcher;
use atoll_server::embed::{
    EmbedderRouter, HttpDenseEncoder, HttpReranker, HttpSparseEncoder, Reranker, SparseEncoder,
};
use atoll_server::error::Result;
use atoll_server::ingest::LocalIngestPayload;
use atoll_server::jobs::spawn_dispatchers;
use atoll_server::meta::MetaStore;
use atoll_server::state::AppContext;
use atoll_server::vector::{HttpStore, MemoryStore, VectorStore};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Multi-tenant code & docs knowledge service — ingest, embed, and search
/// codebases, repositories, and crawled sites.
#[derive(Parser)]
#[command(name = "atoll", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to an atoll.toml config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1
    #[arg(long)]
    bind_all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket server (the default)
    Serve,
    /// Ingest a local directory and wait for the job to finish
    Ingest {
        /// Directory to index
        path: PathBuf,

        /// Explicit project id (default: auto-scoped from the path)
        #[arg(long)]
        project: Option<String>,

        /// Explicit dataset name (default: "local")
        #[arg(long)]
        dataset: Option<String>,

        /// Re-index everything, ignoring snapshots
        #[arg(long)]
        force: bool,
    },
    /// Query a project
    Query {
        /// Query text
        query: String,

        /// Project id (default: auto-scoped from the current directory)
        #[arg(long)]
        project: Option<String>,

        /// Maximum results
        #[arg(long, default_value = "10")]
        top_k: usize,

        /// Output as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
    /// Show project stats
    Stats {
        /// Project id (default: auto-scoped from the current directory)
        #[arg(long)]
        project: Option<String>,
    },
    /// List recent jobs
    Jobs {
        /// Filter by project id
        #[arg(long)]
        project: Option<String>,
    },
    /// Remove a project's (or one dataset's) indexed data
    Clear {
        /// Project id
        project: String,

        /// Only this dataset
        #[arg(long)]
        dataset: Option<String>,

        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn build_context(config: Config) -> Result<Arc<AppContext>> {
    let meta = MetaStore::open(&config.meta_db_path())?;

    let vectors: Arc<dyn VectorStore> = match &config.vector_store_url {
        Some(url) => {
            info!(url = url.as_str(), "using external vector store");
            Arc::new(HttpStore::new(url)?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let text = Arc::new(HttpDenseEncoder::new(&config.text_encoder_url, config.text_encoder_dim)?);
    let code = Arc::new(HttpDenseEncoder::new(&config.code_encoder_url, config.code_encoder_dim)?);
    let sparse: Option<Arc<dyn SparseEncoder>> = if config.enable_hybrid_search {
        Some(Arc::new(HttpSparseEncoder::new(&config.sparse_encoder_url)?))
    } else {
        None
    };
    let router = Arc::new(EmbedderRouter::new(
        text,
        code,
        sparse,
        config.embedding_batch_size,
        config.embedding_concurrency,
    ));
    let reranker: Option<Arc<dyn Reranker>> = if config.enable_reranking {
        Some(Arc::new(HttpReranker::new(&config.reranker_url)?))
    } else {
        None
    };
    let fetcher = Arc::new(HttpPageFetcher::new(&config.page_fetcher_url)?);

    Ok(AppContext::new(config, meta, vectors, router, reranker, fetcher))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Auto-scope the current directory when no project is given.
fn project_or_cwd(ctx: &Arc<AppContext>, project: Option<String>) -> Result<String> {
    if let Some(project) = project {
        return Ok(project);
    }
    let cwd = std::env::current_dir()?;
    let (scope, _) = api::resolve_and_ensure_local(ctx, &cwd, None, None)?;
    Ok(scope.project_id)
}

/// Block until a job reaches a terminal state, echoing progress.
async fn wait_for_job(ctx: &Arc<AppContext>, job_id: &str) -> Result<JobState> {
    let mut last_phase = String::new();
    loop {
        let job = ctx.jobs.get(job_id)?;
        if job.progress.phase != last_phase {
            eprintln!("  [{:>3.0}%] {}", job.progress.fraction * 100.0, job.progress.phase);
            last_phase = job.progress.phase.clone();
        }
        if job.state.is_terminal() {
            return Ok(job.state);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atoll=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "atoll", &mut std::io::stdout());
        return;
    }

    let config = Config::load(cli.config.as_deref());
    let ctx = match build_context(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "could not initialize");
            std::process::exit(1);
        }
    };
    if let Err(e) = ctx.recover() {
        error!(error = %e, "startup recovery failed");
        std::process::exit(1);
    }

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(ctx, cli.bind_all).await,
        Commands::Ingest { path, project, dataset, force } => {
            ingest_and_wait(ctx, path, project, dataset, force).await
        }
        Commands::Query { query, project, top_k, json } => {
            run_query(ctx, query, project, top_k, json).await
        }
        Commands::Stats { project } => {
            let project = match project_or_cwd(&ctx, project) {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "could not resolve project");
                    std::process::exit(1);
                }
            };
            ctx.meta.project_stats(&project).map(|stats| {
                println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
            })
        }
        Commands::Jobs { project } => ctx.jobs.list(project.as_deref(), None, 50).map(|jobs| {
            for job in jobs {
                println!(
                    "{}  {:<18} {:<10} {:>5.0}%  {}",
                    job.id,
                    job.kind.as_str(),
                    job.state.as_str(),
                    job.progress.fraction * 100.0,
                    job.error.unwrap_or_default()
                );
            }
        }),
        Commands::Clear { project, dataset, dry_run } => {
            ctx.meta.clear_project(&project, dataset.as_deref(), dry_run).map(|summary| {
                println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
            })
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn serve(ctx: Arc<AppContext>, bind_all: bool) -> Result<()> {
    let _dispatchers = spawn_dispatchers(Arc::clone(&ctx));
    atoll_server::watch::start_watcher(Arc::clone(&ctx));

    // Hourly dual-store reconciliation sweep.
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if let Err(e) = atoll_server::ingest::reconcile(&ctx).await {
                    error!(error = %e, "reconciliation sweep failed");
                }
            }
        });
    }

    let state = ApiState { ctx, start_time: std::time::Instant::now() };
    let app = api::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::compression::CompressionLayer::new())
        .layer(tower_http::cors::CorsLayer::permissive());

    let bind_addr = if bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port, error = %e, "could not bind to port");
            std::process::exit(1);
        })
    } else {
        // Auto-scan: try 8600..=8609
        const BASE: u16 = 8600;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            if let Ok(l) = tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                found = Some(l);
                break;
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "no free port found");
            eprintln!("  Try: PORT=<port> atoll");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(port, "http://localhost:{port}");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("ATOLL_PORT={port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(atoll_server::error::Error::from)?;
    Ok(())
}

async fn ingest_and_wait(
    ctx: Arc<AppContext>,
    path: PathBuf,
    project: Option<String>,
    dataset: Option<String>,
    force: bool,
) -> Result<()> {
    let _dispatchers = spawn_dispatchers(Arc::clone(&ctx));

    let (scope, dataset_id) = api::resolve_and_ensure_local(&ctx, &path, project, dataset)?;
    eprintln!("Project: {}  dataset: {}", scope.project_id, scope.dataset);

    let path_str = path.to_string_lossy().to_string();
    let payload = LocalIngestPayload { path: path_str.clone(), force };
    let fingerprint = &atoll_core::hash::sha256_hex(path_str.as_bytes())[..16];
    let dedup_key =
        format!("ingest_local:{}:{dataset_id}:{fingerprint}", scope.project_id);
    let (job, _) = ctx.jobs.enqueue(
        atoll_core::types::JobKind::IngestLocal,
        &scope.project_id,
        &dataset_id,
        &dedup_key,
        serde_json::to_value(&payload)?,
    )?;

    let state = wait_for_job(&ctx, &job.id).await?;
    let finished = ctx.jobs.get(&job.id)?;
    match state {
        JobState::Succeeded => {
            println!(
                "{}",
                serde_json::to_string_pretty(&finished.metadata).unwrap_or_default()
            );
            Ok(())
        }
        other => Err(atoll_server::error::Error::InvalidInput(format!(
            "job finished {}: {}",
            other.as_str(),
            finished.error.unwrap_or_default()
        ))),
    }
}

async fn run_query(
    ctx: Arc<AppContext>,
    query: String,
    project: Option<String>,
    top_k: usize,
    json: bool,
) -> Result<()> {
    let project = project_or_cwd(&ctx, project)?;
    let response = atoll_server::retrieve::run_query(
        &ctx,
        QueryRequest {
            query,
            project,
            datasets: None,
            top_k: Some(top_k),
            threshold: None,
            path_prefix: None,
            repo: None,
            lang: None,
            include_global: false,
        },
    )
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{:>2}. {:.4}  {}:{}-{}",
            i + 1,
            hit.score,
            hit.chunk.relative_path,
            hit.chunk.start_line,
            hit.chunk.end_line
        );
        if let Some(symbol) = &hit.chunk.symbol {
            println!("      {} {}", symbol.kind.label(), symbol.name);
        }
    }
    if response.meta.partial {
        eprintln!("  (partial: {})", response.meta.degradation.join(", "));
    }
    Ok(())
}
