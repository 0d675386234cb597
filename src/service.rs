//! Cell service - owns every component and wires them together
//!
//! Nothing in the crate reaches for global state; the service is the single
//! context object the binary (or an embedding application) holds on to.

use crate::{
    config::Config,
    events::{spawn_counter_bridge, EventListener},
    history::RunHistory,
    orchestrator::CellOrchestrator,
    persistence::{JsonlStore, MemoryStore, OperatorDirectory, RunStore, StaticDirectory},
    error::Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

pub struct CellService {
    config: Config,
    store: Arc<dyn RunStore>,
    orchestrator: CellOrchestrator,
    listener: EventListener,
    history: RunHistory,
    counter_bridge: Mutex<Option<JoinHandle<()>>>,
}

impl CellService {
    /// Build the service with the store and directory described by `config`
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn RunStore> = match &config.store.runs_path {
            Some(runs_path) => {
                let counter_path = config
                    .store
                    .counter_path
                    .clone()
                    .unwrap_or_else(|| runs_path.with_extension("counter.json"));
                info!("Recording runs to {}", runs_path.display());
                Arc::new(JsonlStore::new(runs_path.clone(), counter_path))
            }
            None => {
                info!("No run log configured; runs are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        let directory: Arc<dyn OperatorDirectory> =
            Arc::new(StaticDirectory::new(config.operators.admins.clone()));
        Self::with_collaborators(config, store, directory)
    }

    /// Build the service around externally provided collaborators
    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn RunStore>,
        directory: Arc<dyn OperatorDirectory>,
    ) -> Self {
        Self {
            orchestrator: CellOrchestrator::new(config.clone(), Arc::clone(&store)),
            history: RunHistory::new(Arc::clone(&store), directory),
            listener: EventListener::new(),
            counter_bridge: Mutex::new(None),
            config,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &CellOrchestrator {
        &self.orchestrator
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn listener(&self) -> &EventListener {
        &self.listener
    }

    /// Start the robot event listener and feed its tokens into the counters
    pub async fn start_events(&self, port: u16) -> Result<SocketAddr> {
        let mut bridge = self.counter_bridge.lock().await;
        if bridge.is_none() {
            *bridge = Some(spawn_counter_bridge(
                self.listener.subscribe(),
                Arc::clone(&self.store),
            ));
        }
        self.listener.start(port).await
    }

    /// Stop the listener and drop the robot link
    pub async fn shutdown(&self) {
        info!("Shutting down cell service");
        self.listener.stop().await;
        if let Some(bridge) = self.counter_bridge.lock().await.take() {
            bridge.abort();
        }
        self.orchestrator.disconnect().await;
    }
}
