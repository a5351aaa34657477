use llmfleet_control::config::ControlConfig;
use llmfleet_control::{AppState, ServerInfo};
use llmfleet_supervisor::{HealthReconciler, Supervisor};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;
    let supervisor = Supervisor::with_defaults(config.supervisor.clone())?;

    let primary = supervisor
        .register_primary(&config.primary_name, config.port, config.primary_model.clone())
        .await?;

    let model_path = config
        .primary_model
        .as_deref()
        .map(|m| config.supervisor.resolve_model(m).display().to_string());
    let info = ServerInfo {
        ip: config.advertised_ip(),
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string()),
        port: config.port,
        primary: Some(primary.id),
        model_path,
    };

    let reconciler = HealthReconciler::new(supervisor.clone()).spawn();

    let app = llmfleet_control::router(AppState::new(supervisor.clone(), info));
    let addr = config.addr();
    tracing::info!(%addr, "llmfleet-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    reconciler.abort();
    supervisor.shutdown().await;

    Ok(())
}
