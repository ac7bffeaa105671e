use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use followgraph_common::{Config, CredentialsTable};
use followgraph_graph::{migrate::migrate, GraphBatchWriter, GraphClient};
use followgraph_worker::{
    AmqpQueue, ControlChannel, QueueTopology, RedisDedupStore, TaskProcessor, TwitterConnector,
    Worker,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("followgraph=info".parse()?))
        .init();

    info!("Follower fetcher starting...");

    // Load config
    let config = Config::from_env()?;
    config.log_redacted();

    let table = CredentialsTable::load(&config.credentials_path)
        .with_context(|| format!("Failed to load credentials from {}", config.credentials_path))?;
    let credentials = table.select(config.fetcher_id)?.clone();
    info!(
        fetcher_id = config.fetcher_id,
        bundles = table.len(),
        "Selected credentials"
    );

    // Connect to Neo4j
    let client =
        GraphClient::connect(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
            .await?;

    // Run migrations
    migrate(&client).await?;

    let dedup =
        Arc::new(RedisDedupStore::connect(&config.redis_url, &config.dedup_set_key).await?);

    let topology = QueueTopology::from_config(&config);
    let queue = Arc::new(AmqpQueue::connect(&config.broker_url, topology).await?);
    let (fatal_tx, fatal_rx) = oneshot::channel();
    queue.on_connection_error(fatal_tx);

    let processor = Arc::new(TaskProcessor::new(dedup, GraphBatchWriter::neo4j(client)));
    let worker = Arc::new(Worker::new(
        config.worker_name.clone(),
        queue.clone(),
        processor,
        Arc::new(TwitterConnector),
    ));

    let control = ControlChannel::new(worker.clone(), queue.clone());
    let control_handle = tokio::spawn(control.run(queue.control_consumer().await?));

    worker.set_credentials(credentials).await?;
    worker.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        err = fatal_rx => {
            match err {
                Ok(e) => error!(error = %e, "Broker connection lost"),
                Err(_) => warn!("Broker error notifier dropped"),
            }
        }
    }

    // A control command mid-rotation holds the lifecycle lock until its
    // in-flight task settles, so stop the control loop before taking it.
    control_handle.abort();
    match tokio::time::timeout(STOP_TIMEOUT, worker.stop()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to unsubscribe cleanly"),
        Err(_) => warn!(
            timeout_secs = STOP_TIMEOUT.as_secs(),
            "Timed out waiting for the worker to stop"
        ),
    }
    if let Err(e) = queue.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }

    info!("Follower fetcher stopped");
    Ok(())
}
