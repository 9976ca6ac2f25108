mod rpc;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mailroom_core::auth::StaticAuthenticator;
use mailroom_core::cleanup::run_scheduler;
use mailroom_core::gmail::GmailRestClient;
use mailroom_core::jobs::{JobDispatcher, WorkerConfig, run_worker};
use mailroom_core::{Authenticator, Config, Resources, ToolDispatcher, init_telemetry};

const SCHEDULER_TICK: Duration = Duration::from_secs(30);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match env::var("CONFIG_PATH") {
        Ok(path) => Config::load(&path)?,
        Err(_) => Config::from_env()?,
    };

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let authenticator = build_authenticator(&config)?;
    let resources = Resources::build(config, authenticator).await?;
    resources.recover().await?;

    let shutdown = CancellationToken::new();
    let dispatcher = JobDispatcher::new(resources.clone());
    let worker_config = WorkerConfig {
        poll_interval: Duration::from_millis(resources.config.jobs.poll_interval_ms),
        ..WorkerConfig::default()
    };

    let mut worker_handles = Vec::new();
    for _ in 0..resources.config.jobs.workers.max(1) {
        worker_handles.push(tokio::spawn(run_worker(
            resources.queue.clone(),
            resources.store.clone(),
            Arc::new(dispatcher.clone()),
            worker_config,
            shutdown.child_token(),
        )));
    }

    let scheduler_handle = tokio::spawn(run_scheduler(
        resources.factory.clone(),
        resources.store.clone(),
        resources.queue.clone(),
        SCHEDULER_TICK,
        shutdown.child_token(),
    ));

    let housekeeping_handle = tokio::spawn(housekeeping_loop(
        resources.clone(),
        shutdown.child_token(),
    ));

    info!(
        workers = resources.config.jobs.workers.max(1),
        storage = %resources.config.storage.path.display(),
        "mailroom listening on stdio"
    );

    let tool_dispatcher = Arc::new(ToolDispatcher::new(resources.clone()));
    let rpc_shutdown = shutdown.child_token();
    let rpc = rpc::run(
        tool_dispatcher,
        tokio::io::stdin(),
        tokio::io::stdout(),
        rpc_shutdown,
    );

    tokio::select! {
        result = rpc => {
            if let Err(err) = result {
                warn!(error = %err, "rpc loop ended with error");
            }
        }
        _ = shutdown_signal() => {
            warn!("received shutdown signal");
        }
    }

    shutdown.cancel();
    for handle in worker_handles {
        if let Err(err) = handle.await {
            warn!("worker task join error: {err}");
        }
    }
    if let Err(err) = scheduler_handle.await {
        warn!("scheduler task join error: {err}");
    }
    if let Err(err) = housekeeping_handle.await {
        warn!("housekeeping task join error: {err}");
    }
    info!("mailroom shut down");
    Ok(())
}

/// Dev/single-user wiring: a static vendor client when an access token is
/// in the environment. Multi-tenant deployments replace this with a real
/// OAuth authenticator.
fn build_authenticator(
    config: &Config,
) -> Result<Option<Arc<dyn Authenticator>>, Box<dyn std::error::Error>> {
    let Ok(token) = env::var("GMAIL_ACCESS_TOKEN") else {
        return Ok(None);
    };
    let mut client = GmailRestClient::new(
        token,
        Duration::from_secs(config.gmail.request_timeout_secs),
    )?;
    if let Some(api_base) = &config.gmail.api_base {
        client = client.with_api_base(api_base.clone());
    }
    Ok(Some(Arc::new(StaticAuthenticator::new(Arc::new(client)))))
}

async fn housekeeping_loop(resources: Arc<Resources>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {}
        }
        resources.housekeep().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
