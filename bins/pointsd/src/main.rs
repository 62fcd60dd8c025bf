mod heartbeat;
mod module;
#[cfg(feature = "web-api")]
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use points_core::cfg::{self, AppId, Config};
use points_core::{logx, store, PeopleService};
use tracing::{info, warn};

use crate::heartbeat::Heartbeat;
use crate::module::{Module, ModuleCtx};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"), // <- no literal; comes from crate name
};

#[derive(Parser)]
#[command(name=env!("CARGO_PKG_NAME"), version, about="People records with timed points accrual")]
struct Cli {
    /// Config file (defaults to the per-user config dir)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log level override (info,debug,trace)
    #[arg(long)]
    log: Option<String>,
    /// HTTP listen address override
    #[arg(long)]
    http: Option<SocketAddr>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => cfg::load_or_init_at(path)?,
        None => cfg::load_or_init(&APP)?,
    };
    let level = cli.log.as_deref().unwrap_or(&cfg.log_level);
    logx::init_with(level, cfg.log_format);

    runtime()?.block_on(run(cli, cfg))
}

#[cfg(feature = "rt-single")]
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")
}

#[cfg(not(feature = "rt-single"))]
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .context("build runtime")
}

async fn run(cli: Cli, cfg: Config) -> Result<()> {
    info!("{} boot", APP.application);
    let data_dir = cfg.data_dir(&APP)?;
    info!("cfg data_dir={}", data_dir.display());
    let kv = store::open_default(&data_dir)?;
    let service = PeopleService::from_config(kv, &cfg);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ctx = ModuleCtx { service: service.clone(), shutdown: shutdown_rx };

    #[allow(unused_mut)]
    let mut modules: Vec<Box<dyn Module>> = vec![
        Box::new(Heartbeat::new(Duration::from_secs(cfg.heartbeat_secs.max(1)))),
    ];
    #[cfg(feature = "web-api")]
    {
        let addr: SocketAddr = match cli.http {
            Some(addr) => addr,
            None => cfg.http_addr.parse().with_context(|| format!("parse http_addr {}", cfg.http_addr))?,
        };
        modules.push(Box::new(web::WebServer::new(addr)));
    }
    #[cfg(not(feature = "web-api"))]
    if cli.http.is_some() {
        warn!("--http ignored: built without web-api");
    }

    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| {
            let name = m.name();
            info!("starting module {name}");
            (name, m.spawn(ctx.clone()))
        })
        .collect();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => info!("module {name} stopped"),
            Ok(Err(e)) => warn!("module {name} failed: {e:#}"),
            Err(e) => warn!("module {name} panicked: {e}"),
        }
    }
    service.shutdown().await;
    info!("{} stopped", APP.application);
    Ok(())
}
