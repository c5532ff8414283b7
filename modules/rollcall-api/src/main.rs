use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use rollcall_api::cli::Cli;
use rollcall_api::{router, AppState};
use rollcall_common::{GatewayConfig, RunStatus};
use rollcall_scout::gateway::HttpGateway;
use rollcall_scout::log_buffer::LogBuffer;
use rollcall_scout::run::Run;
use rollcall_scout::stop::StopSignal;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let logs = LogBuffer::default();
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("rollcall=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();

    let cli = Cli::parse();
    let config = cli.into_run_config().context("Invalid command line")?;
    let dashboard = config.dashboard.clone();

    let gateway_config = GatewayConfig::from_env().context("Failed to load gateway configuration")?;
    gateway_config.log_redacted();
    let gateway = HttpGateway::new(&gateway_config).context("Failed to build HTTP client")?;

    let stop = StopSignal::new();
    let run = Run::prepare(config, Arc::new(gateway), stop.clone())
        .await
        .context("Failed to prepare run")?;

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight work");
                stop.trigger();
            }
        });
    }

    if let Some(dashboard) = &dashboard {
        let state = Arc::new(AppState {
            stats: run.stats(),
            recent: run.recent(),
            logs: logs.clone(),
            stop: stop.clone(),
        });
        let addr = format!("{}:{}", dashboard.host, dashboard.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind dashboard on {addr}"))?;
        info!("Dashboard listening on http://{addr}");
        let app = router(state);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Dashboard server stopped");
            }
        });
    }

    let status = run.execute().await;

    if dashboard.is_some() && !stop.is_stopped() {
        info!("Run finished; dashboard stays up until interrupted");
        stop.stopped().await;
    }

    match status {
        RunStatus::Failed { cause } => anyhow::bail!("Run failed: {cause}"),
        other => {
            info!(status = ?other, "Exiting");
            Ok(())
        }
    }
}
