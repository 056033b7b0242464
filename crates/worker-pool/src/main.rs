//! Carepath Worker binary.
//!
//! Composition root for an embedded runtime: in-memory stores and
//! broker wired into the engine, with the three lane consumers running
//! until shutdown. External deployments swap the seams for real
//! implementations.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carepath_engine::audit::{AuditOutbox, InMemoryAuditSink};
use carepath_engine::config::EngineConfig;
use carepath_engine::engine::{Dispatcher, NextStepResolver};
use carepath_engine::notify::LogNotifier;
use carepath_engine::queue::{InMemoryBroker, QueueBroker};
use carepath_engine::store::{
    DoctorStore, InMemoryDirectory, InMemoryStepStore, InMemoryWorkflowStore, PatientStore,
    StepStore, WorkflowStore,
};

use carepath_worker::{StepExecutor, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,carepath_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    tracing::info!("Starting Carepath Worker");

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        worker_id = %config.worker_id,
        normal = config.normal_concurrency,
        priority = config.priority_concurrency,
        scheduled = config.scheduled_concurrency,
        "Worker configuration loaded"
    );

    let engine_config = EngineConfig::default();
    let directory = Arc::new(InMemoryDirectory::new());
    let steps: Arc<dyn StepStore> = Arc::new(InMemoryStepStore::new());
    let workflows: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
    let broker = Arc::new(InMemoryBroker::new());

    let audit = Arc::new(AuditOutbox::spawn(
        Arc::new(InMemoryAuditSink::new()),
        engine_config.audit_buffer,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        steps.clone(),
        broker.clone() as Arc<dyn QueueBroker>,
        engine_config,
    ));
    let resolver = Arc::new(NextStepResolver::new(
        steps.clone(),
        workflows.clone(),
        dispatcher.clone(),
        audit.clone(),
    ));
    let executor = Arc::new(StepExecutor::new(
        steps,
        workflows,
        directory.clone() as Arc<dyn PatientStore>,
        directory as Arc<dyn DoctorStore>,
        Arc::new(LogNotifier),
        dispatcher,
        resolver,
        audit.clone(),
    ));

    let worker = Worker::new(config, broker.clone() as Arc<dyn QueueBroker>, executor);

    // Handle shutdown signals
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                return Err(e);
            }
        }
        _ = shutdown => {
            tracing::info!("Shutting down worker");
            broker.close().await;
        }
    }

    // Drain buffered audit records before exiting.
    audit.shutdown().await;

    tracing::info!("Worker stopped");
    Ok(())
}
