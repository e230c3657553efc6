//! Wiring of backends, pipeline and worker from an [`AppConfig`].

use std::sync::Arc;

use api::{jobs, request_graph, Answering, AppState, EchoResponder, PipelineDeps};
use db::{PgCheckpointStore, PgConfigBroker, PgTaskBackend};
use engine::{CheckpointStore, InMemoryCheckpointStore, WorkflowExecutor};
use nodes::ObjectRegistry;
use queue::{
    ConfigBroker, Dispatcher, InMemoryConfigBroker, InMemoryTaskBackend, TaskBackend, Tracker,
    Worker,
};
use tracing::{info, warn};

use crate::config::AppConfig;

pub struct Services {
    pub backend: Arc<dyn TaskBackend>,
    pub broker: Arc<dyn ConfigBroker>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub tracker: Tracker,
    pub answering: Answering,
    /// `true` when nothing outlives the process.
    pub in_memory: bool,
}

impl Services {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let answering = Answering::new(Arc::new(EchoResponder), config.retry.clone());

        let (backend, broker, checkpoints, in_memory): (
            Arc<dyn TaskBackend>,
            Arc<dyn ConfigBroker>,
            Arc<dyn CheckpointStore>,
            bool,
        ) = match &config.database_url {
            Some(url) => {
                let pool = db::create_pool(url, &config.database).await?;
                (
                    Arc::new(PgTaskBackend::new(pool.clone())),
                    Arc::new(PgConfigBroker::new(pool.clone())),
                    Arc::new(PgCheckpointStore::new(pool)),
                    false,
                )
            }
            None => {
                warn!("no database configured, using in-memory queue and checkpoints");
                (
                    Arc::new(InMemoryTaskBackend::new()),
                    Arc::new(InMemoryConfigBroker::new()),
                    Arc::new(InMemoryCheckpointStore::new()),
                    true,
                )
            }
        };

        let tracker = Tracker::new(backend.clone(), config.tracker.clone());
        Ok(Self { backend, broker, checkpoints, tracker, answering, in_memory })
    }

    pub fn executor(
        &self,
        config: &AppConfig,
    ) -> anyhow::Result<WorkflowExecutor<api::RequestStep>> {
        let dispatcher =
            Dispatcher::new(self.backend.clone(), self.broker.clone(), config.dispatch.clone());
        let deps = PipelineDeps {
            answering: self.answering.clone(),
            registry: Arc::new(ObjectRegistry::new()),
            dispatcher,
            tracker: self.tracker.clone(),
            poll: config.poll.clone(),
        };
        let graph = request_graph(deps)?;
        info!(nodes = graph.len(), "request pipeline built");
        Ok(WorkflowExecutor::new(graph, config.executor.clone())
            .with_checkpoints(self.checkpoints.clone()))
    }

    pub fn app_state(&self, config: &AppConfig) -> anyhow::Result<AppState> {
        Ok(AppState { executor: Arc::new(self.executor(config)?), tracker: self.tracker.clone() })
    }

    pub fn worker(&self, config: &AppConfig) -> Worker {
        Worker::new(
            self.backend.clone(),
            self.broker.clone(),
            self.tracker.clone(),
            jobs::registry(self.answering.clone()),
            config.worker.clone(),
        )
    }
}
