use crate::auth::AccessVerifier;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::registry::SessionRegistry;
use crate::router::NotificationRouter;
use flock_storage::RelationStore;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug)]
pub enum ServerError {
    Io,
    Storage,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "io failure"),
            Self::Storage => write!(f, "storage failure"),
        }
    }
}

impl Error for ServerError {}

/// Shared server state handed to every connection task.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn RelationStore>,
    pub verifier: Box<dyn AccessVerifier>,
    pub registry: Arc<SessionRegistry>,
    pub router: NotificationRouter,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RelationStore>,
        verifier: Box<dyn AccessVerifier>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let router = NotificationRouter::new(registry.clone(), metrics.clone());
        Arc::new(Self {
            config,
            store,
            verifier,
            registry,
            router,
            metrics,
        })
    }
}
