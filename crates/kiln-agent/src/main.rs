use std::{future::IntoFuture, sync::Arc};

use anyhow::Context;
use kiln_agent::{
    config::SupervisorConfig,
    http_api,
    hub::ObserverHub,
    monitor::Monitor,
    process_manager::ProcessManager,
    pty::PtyLauncher,
    recovery::{self, ExitHandle},
    state::AppState,
    status_query::SlpProbe,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(cfg: &SupervisorConfig) -> Option<WorkerGuard> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr));

    match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "kiln-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = SupervisorConfig::from_env()?;
    let log_guard = init_tracing(&cfg);

    tokio::fs::create_dir_all(cfg.servers_dir())
        .await
        .with_context(|| format!("create {}", cfg.servers_dir().display()))?;

    let cfg = Arc::new(cfg);
    let manager = ProcessManager::new(cfg.clone(), Arc::new(PtyLauncher), ObserverHub::new());
    let (exit, mut exit_rx) = ExitHandle::channel();

    let recovered = recovery::consume_on_startup(&manager).await;
    if !recovered.is_empty() {
        tracing::info!(
            servers = ?recovered,
            delay_ms = cfg.recovery_delay.as_millis() as u64,
            "scheduled recovery starts"
        );
    }

    Monitor::new(manager.clone(), SlpProbe::new(cfg.probe_timeout)).spawn();

    let app = http_api::router(AppState {
        manager: manager.clone(),
        exit,
    });
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    tracing::info!(
        addr = %cfg.listen_addr,
        data_root = %cfg.data_root.display(),
        "kiln-agent listening"
    );

    let code = tokio::select! {
        res = axum::serve(listener, app).into_future() => {
            res.context("http server")?;
            0
        }
        Some(code) = exit_rx.recv() => code,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping servers");
            manager.stop_all().await;
            tokio::time::sleep(cfg.exit_grace).await;
            0
        }
    };

    tracing::info!(exit_code = code, "kiln-agent exiting");
    drop(log_guard);
    std::process::exit(code);
}
