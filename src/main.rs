use anyhow::{Context, Result};
use apprelease_exporter::{
    cache::ReportCache,
    collector::{Collector, DockerCollector, GithubCollector, StatsCollector},
    config::{parse_duration, Config},
    cve::CveClient,
    github::{HttpGithubClient, DEFAULT_API_URL},
    logging::init_tracing,
    metrics::MetricsStore,
    scheduler::{CollectorScheduler, ScrapeStats},
    server,
};
use clap::Parser;
use futures::future::join_all;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Interval of the internal scheduler that exports collector timings.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "apprelease-exporter")]
#[command(
    author,
    version,
    about = "Prometheus exporter for Docker and GitHub releases with CVE correlation"
)]
struct Cli {
    /// Project configuration file (YAML or TOML)
    #[arg(short, long, env = "CONFIG")]
    config: PathBuf,

    /// Debug logging
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Verbose logging
    #[arg(short, long, env = "VERBOSE")]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long = "log.json", env = "LOG_JSON")]
    log_json: bool,

    /// Server address, `:port` listens on all interfaces
    #[arg(long, env = "SERVER_BIND", default_value = ":8080")]
    bind: String,

    /// Default scrape interval
    #[arg(long = "scrape-time", env = "SCRAPE_TIME", default_value = "12h", value_parser = parse_duration)]
    scrape_time: Duration,

    /// Scrape interval for Docker projects, 0 disables them
    #[arg(long = "scrape-time.docker", env = "SCRAPE_TIME_DOCKER", value_parser = parse_duration)]
    scrape_time_docker: Option<Duration>,

    /// Scrape interval for GitHub projects, 0 disables them
    #[arg(long = "scrape-time.github", env = "SCRAPE_TIME_GITHUB", value_parser = parse_duration)]
    scrape_time_github: Option<Duration>,

    /// URL of a cve-search instance
    #[arg(long = "cve.url", env = "CVE_URL")]
    cve_url: Option<String>,

    /// GitHub personal access token
    #[arg(
        long = "github.personalaccesstoken",
        env = "GITHUB_PERSONALACCESSTOKEN",
        hide_env_values = true
    )]
    github_token: Option<String>,

    /// Pause between two GitHub projects
    #[arg(long = "github.scrape-wait", env = "GITHUB_SCRAPEWAIT", default_value = "2s", value_parser = parse_duration)]
    github_scrape_wait: Duration,

    /// Releases or tags fetched per GitHub project
    #[arg(long = "github.limit", env = "GITHUB_LIMIT", default_value_t = 25)]
    github_limit: usize,

    /// Tags reported per Docker project
    #[arg(long = "docker.limit", env = "DOCKER_LIMIT", default_value_t = 25)]
    docker_limit: usize,

    /// Directory for cached CVE reports
    #[arg(long = "cache.path", env = "CACHE_PATH")]
    cache_path: Option<PathBuf>,

    /// Age after which a cached CVE report is refreshed
    #[arg(long = "cache.ttl", env = "CACHE_TTL", default_value = "24h", value_parser = parse_duration)]
    cache_ttl: Duration,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.verbose, cli.log_json)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting apprelease-exporter");

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    info!(
        docker = config.projects.docker.len(),
        github = config.projects.github.len(),
        "configuration loaded"
    );

    let cve = build_cve_client(&cli)?;

    let github = HttpGithubClient::new(DEFAULT_API_URL, cli.github_token.clone())?;
    if github.has_token() {
        github
            .verify()
            .await
            .context("github personal access token was rejected")?;
        info!("github personal access token verified");
    }

    let store = Arc::new(MetricsStore::new());
    let stats = ScrapeStats::default();
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let docker: Arc<dyn Collector> = Arc::new(DockerCollector::new(
        config.projects.docker,
        cve.clone(),
        cli.docker_limit,
    )?);
    let github: Arc<dyn Collector> = Arc::new(GithubCollector::new(
        config.projects.github,
        Arc::new(github),
        cve,
        cli.github_limit,
        cli.github_scrape_wait,
    ));

    for (collector, interval) in [
        (docker, cli.scrape_time_docker.unwrap_or(cli.scrape_time)),
        (github, cli.scrape_time_github.unwrap_or(cli.scrape_time)),
    ] {
        let name = collector.name();
        match CollectorScheduler::new(collector, interval, store.clone(), stats.clone()) {
            Some(scheduler) => tasks.push(spawn_scheduler(scheduler, &cancel)),
            None => info!(collector = name, "collector disabled"),
        }
    }

    let stats_collector: Arc<dyn Collector> = Arc::new(StatsCollector::new(stats.clone()));
    if let Some(scheduler) =
        CollectorScheduler::new(stats_collector, STATS_INTERVAL, store.clone(), stats)
    {
        tasks.push(spawn_scheduler(scheduler.hidden(), &cancel));
    }

    let addr = server::parse_bind(&cli.bind)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, "listening");

    axum::serve(listener, server::router(store))
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "scheduler task failed");
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn build_cve_client(cli: &Cli) -> Result<Option<Arc<CveClient>>> {
    let Some(url) = cli.cve_url.as_deref().filter(|url| !url.is_empty()) else {
        info!("cve correlation disabled");
        return Ok(None);
    };

    let cache = cli
        .cache_path
        .as_ref()
        .map(|path| ReportCache::new(path, cli.cache_ttl));
    match &cache {
        Some(cache) => info!(url, path = %cache.dir().display(), ttl = ?cache.ttl(), "cve correlation enabled"),
        None => info!(url, "cve correlation enabled without cache"),
    }

    Ok(Some(Arc::new(CveClient::new(url, cache)?)))
}

fn spawn_scheduler(scheduler: CollectorScheduler, cancel: &CancellationToken) -> JoinHandle<()> {
    info!(
        collector = scheduler.name(),
        interval = ?scheduler.interval(),
        "starting collector"
    );
    let cancel = cancel.clone();
    tokio::spawn(async move { scheduler.run(cancel).await })
}

/// Resolves on Ctrl-C or SIGTERM and cancels all schedulers.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    cancel.cancel();
}
