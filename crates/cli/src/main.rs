//! Atoll CLI — command-line client for a running atoll server.
//!
//! Talks to the HTTP API; start the server with `atoll` first.

use clap::{Parser, Subcommand};
use serde_json::json;

use atoll_core::types::{QueryRequest, QueryResponse};

/// Atoll CLI — search and manage your indexed projects from the terminal.
#[derive(Parser)]
#[command(name = "atl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server base URL (or set ATOLL_SERVER)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Search a project
    Query {
        /// Query text
        query: String,

        /// Project id
        #[arg(long)]
        project: String,

        /// Restrict to these datasets (repeatable)
        #[arg(long = "dataset")]
        datasets: Vec<String>,

        /// Maximum number of results
        #[arg(long, default_value = "10")]
        top_k: usize,

        /// Include global-scope datasets
        #[arg(long)]
        include_global: bool,
    },
    /// Ingest a local directory
    Ingest {
        /// Directory to index
        path: String,

        /// Explicit project id
        #[arg(long)]
        project: Option<String>,

        /// Explicit dataset name
        #[arg(long)]
        dataset: Option<String>,

        /// Re-index everything, ignoring snapshots
        #[arg(long)]
        force: bool,
    },
    /// Crawl a site into a project
    Crawl {
        /// Seed URL
        url: String,

        /// single, sitemap, or recursive
        #[arg(long, default_value = "recursive")]
        mode: String,

        /// Page cap
        #[arg(long, default_value = "100")]
        max_pages: usize,

        /// Depth cap
        #[arg(long, default_value = "3")]
        max_depth: usize,
    },
    /// Show a job (or list recent jobs)
    Jobs {
        /// Job id; omit to list
        id: Option<String>,

        /// Filter the list by project
        #[arg(long)]
        project: Option<String>,
    },
    /// Cancel a job
    Cancel {
        /// Job id
        id: String,
    },
    /// Project stats
    Stats {
        /// Project id
        project: String,
    },
}

fn server_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("ATOLL_SERVER").ok())
        .unwrap_or_else(|| "http://127.0.0.1:8600".to_string())
        .trim_end_matches('/')
        .to_string()
}

async fn fail_on_error(resp: reqwest::Response) -> reqwest::Result<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("request failed");
        eprintln!("error ({status}): {message}");
        std::process::exit(1);
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let base = server_url(cli.server.clone());
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Query { query, project, datasets, top_k, include_global } => {
            let request = QueryRequest {
                query,
                project,
                datasets: if datasets.is_empty() { None } else { Some(datasets) },
                top_k: Some(top_k),
                threshold: None,
                path_prefix: None,
                repo: None,
                lang: None,
                include_global,
            };
            let resp = client.post(format!("{base}/api/query")).json(&request).send().await?;
            let body = fail_on_error(resp).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&body)?);
                return Ok(());
            }
            let parsed: QueryResponse = serde_json::from_value(body)?;
            for (i, hit) in parsed.results.iter().enumerate() {
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
            if parsed.meta.partial {
                eprintln!("  (partial: {})", parsed.meta.degradation.join(", "));
            }
        }
        Commands::Ingest { path, project, dataset, force } => {
            let body = json!({ "path": path, "project": project, "dataset": dataset, "force": force });
            let resp =
                client.post(format!("{base}/api/ingest/local")).json(&body).send().await?;
            let body = fail_on_error(resp).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Crawl { url, mode, max_pages, max_depth } => {
            let body = json!({
                "seed_url": url,
                "mode": mode,
                "max_pages": max_pages,
                "max_depth": max_depth,
            });
            let resp =
                client.post(format!("{base}/api/ingest/crawl")).json(&body).send().await?;
            let body = fail_on_error(resp).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Jobs { id, project } => {
            let url = match id {
                Some(id) => format!("{base}/api/jobs/{id}"),
                None => match project {
                    Some(p) => format!("{base}/api/jobs?project={p}"),
                    None => format!("{base}/api/jobs"),
                },
            };
            let resp = client.get(url).send().await?;
            let body = fail_on_error(resp).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Cancel { id } => {
            let resp = client.post(format!("{base}/api/jobs/{id}/cancel")).send().await?;
            let body = fail_on_error(resp).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Stats { project } => {
            let resp =
                client.get(format!("{base}/api/projects/{project}/stats")).send().await?;
            let body = fail_on_error(resp).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(())
}
