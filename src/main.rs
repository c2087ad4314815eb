//! OSO PostgreSQL Provisioning Kubernetes Operator
//!
//! Main entry point for the operator. Loads configuration, wires the
//! provisioning backends, registers CRD controllers, and runs the
//! reconciliation loops.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use postgres_provisioning_operator::{
    adapters::{KubeResourceClient, KubeSecretStore, KubeVolumeClaims},
    backends::{build_registry, BackendKind, HelmCli, InstanceApi, PostgresAdmin, ProviderClients},
    config::{Configuration, OperatorSettings, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    controllers::{self, Context},
    metrics,
    reconcilers::ReconcileContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    info!("Starting OSO PostgreSQL Provisioning Operator");

    // Configuration errors are fatal before any reconcile runs
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Configuration::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?
        .with_process_env();
    let settings = OperatorSettings::from_config(&config, std::env::var("POD_NAMESPACE").ok())?;
    settings.verify()?;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // This binary ships no cloud SDK. Managed backends (awsrds, awsaurora,
    // azurepostgresflexible) register only when a host embedding the crate
    // supplies an InstanceApi per kind; here only the Helm backends exist.
    let instances: HashMap<BackendKind, Arc<dyn InstanceApi>> = HashMap::new();
    let clients = ProviderClients {
        sql: Arc::new(PostgresAdmin::default()),
        helm: Some(Arc::new(HelmCli::new("helm", settings.provisioning.ready_timeout))),
        volumes: Some(Arc::new(KubeVolumeClaims::new(client.clone()))),
        instances,
    };
    let registry = build_registry(&config, &settings, clients)?;

    let reconcile = ReconcileContext::new(
        settings.clone(),
        registry,
        Arc::new(KubeSecretStore::new(client.clone())),
        Arc::new(KubeResourceClient::new(client.clone())),
    );
    let context = Arc::new(Context::new(client.clone(), reconcile));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(settings.metrics_port));
    info!("Metrics server starting on port {}", settings.metrics_port);

    // Run all controllers concurrently
    let server_controller = controllers::run_server_controller(client.clone(), context.clone());
    let database_controller = controllers::run_database_controller(client.clone(), context.clone());

    // Handle graceful shutdown
    tokio::select! {
        _ = server_controller => {
            metrics::OPERATOR_HEALTH.set(0.0);
            error!("Server controller exited unexpectedly");
        }
        _ = database_controller => {
            metrics::OPERATOR_HEALTH.set(0.0);
            error!("Database controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    info!("OSO PostgreSQL Provisioning Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn,tokio_postgres=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
