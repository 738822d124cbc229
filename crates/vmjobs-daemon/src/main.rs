use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use vmjobs_core::config::VmJobsConfig;
use vmjobs_scheduler::{JobRegistry, SchedulerEngine, SchedulerHandle};

mod app;
mod http;
mod reporter;

use app::App;

/// Distributed job scheduler for time-series extraction and collection.
#[derive(Parser, Debug)]
#[command(name = "vmjobs", version)]
struct Cli {
    /// Config file (default: ~/.vmjobs/vmjobs.toml, or VMJOBS_CONFIG)
    #[arg(short, long, global = true, env = "VMJOBS_CONFIG")]
    config: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run one job now and print its result document
    Once {
        #[arg(long)]
        job_id: String,
    },
    /// List configured jobs
    List,
    /// Force a collector's watermark to an earlier date
    Backfill {
        #[arg(long)]
        job_id: String,
        /// Business date, YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "vmjobs=debug" } else { "vmjobs=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{default_filter},tower_http=info").into()),
        )
        .init();

    let config = VmJobsConfig::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Command::List => {
            list(&config);
            Ok(())
        }
        Command::Run => run(App::build(config).await?, cli.config).await,
        Command::Once { job_id } => once(App::build(config).await?, &job_id).await,
        Command::Backfill { job_id, date } => {
            let app = App::build(config).await?;
            let def = JobRegistry::load(app.config.jobs.clone())?.get(&job_id)?;
            let previous = vmjobs_jobs::backfill(app.runner.context(), &def, date).await?;
            match previous {
                Some(p) => println!("{job_id}: watermark {p} -> {date}"),
                None => println!("{job_id}: watermark set to {date}"),
            }
            Ok(())
        }
    }
}

fn list(config: &VmJobsConfig) {
    for job in &config.jobs {
        let state = if job.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<32} {:<10} {:<9} {}",
            job.id, job.kind, state, job.schedule
        );
    }
}

async fn once(app: App, job_id: &str) -> anyhow::Result<()> {
    let registry = Arc::new(JobRegistry::load(app.config.jobs.clone())?);
    let settings = app.engine_settings();
    let engine = SchedulerEngine::new(registry, app.locks, app.runner, settings, None);

    let Some(report) = engine.run_once(job_id).await? else {
        anyhow::bail!("job {job_id} is locked by another scheduler");
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(app: App, config_path: Option<String>) -> anyhow::Result<()> {
    let registry = Arc::new(JobRegistry::load(app.config.jobs.clone())?);

    // Run summaries: SchedulerEngine → reporter task
    let (report_tx, report_rx) = tokio::sync::mpsc::channel(256);
    tokio::spawn(reporter::run(Arc::clone(&app.tsdb), report_rx));

    let engine = SchedulerEngine::new(
        registry,
        app.locks.clone(),
        app.runner.clone(),
        app.engine_settings(),
        Some(report_tx),
    );
    let handle = engine.handle();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    tokio::spawn(reload_on_hangup(handle.clone(), config_path));

    if app.config.http.enabled {
        let addr: SocketAddr = format!("{}:{}", app.config.http.bind, app.config.http.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("vmjobs health endpoint listening on {}", addr);
        let router = http::build_router(handle);
        let mut server_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = served {
                error!("health endpoint failed: {e}");
            }
        });
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    Ok(())
}

/// Re-reads the config file on SIGHUP and swaps in its job list.
async fn reload_on_hangup(handle: SchedulerHandle, config_path: Option<String>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGHUP handler unavailable, config reload disabled: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading jobs");
            match VmJobsConfig::load(config_path.as_deref()) {
                Ok(config) => {
                    if handle.reload(config.jobs).await.is_err() {
                        return;
                    }
                }
                Err(e) => error!(error = %e, "Config reload failed, keeping current jobs"),
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (handle, config_path);
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal"),
                    _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => warn!("signal handlers unavailable ({e}), using ctrl-c"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("ctrl-c handler failed: {e}");
    }
    info!("shutdown signal");
}
