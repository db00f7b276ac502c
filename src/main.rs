mod check;
mod config;
mod executor;
mod gate;
mod http;
mod metrics;
mod modules;
mod privileges;
mod process;
mod registry;
mod result;
mod template;

use axum::serve;
use clap::Parser;
use config::Config;
use metrics::Metrics;
use modules::Capabilities;
use registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "smokerd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "/etc/smokerd/smokerd.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
        if let Err(err) = cfg.validate() {
            error!(error = %err, "invalid --listen");
            std::process::exit(1);
        }
    }

    info!(
        listen = %cfg.listen,
        tick_interval_secs = cfg.tick_interval_secs,
        "starting smokerd"
    );

    let registry = match Registry::load(
        &cfg.check_tables(),
        cfg.engine_settings(),
        Capabilities::builtin(),
    ) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!(error = %err, "failed to load plugins");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };
    metrics.set_checks_configured(registry.check_names().len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let registry = registry.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, registry);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };
            info!(%addr, "REST API listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let scheduler_task = {
        let tick_interval = cfg.tick_interval();
        let metrics = metrics.clone();
        let registry = registry.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("shutdown requested, stopping scheduler");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = registry.tick();
                        if !report.launched.is_empty() {
                            debug!(launched = %report.launched.join(","), "checks launched");
                        }
                        for name in &report.deadlocked {
                            error!(check = %name, "check deadlocked and was suspended");
                        }
                        metrics.update_from_tick(&report);
                        let gate = registry.gate();
                        metrics.set_gate(gate.size(), gate.in_flight(), gate.waiting());
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;

    let left = registry.shutdown(cfg.shutdown_timeout()).await;
    if !left.is_empty() {
        warn!(checks = %left.join(","), "plugins still running at exit");
    }
    process::reap_registered();

    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
