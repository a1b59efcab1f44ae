//! Application state management

use crate::config::{ServerConfig, SourceKind};
use rr_adapters::{DemoStore, OpenF1Client};
use rr_core::{adapter::SampleStore, error::ReplayError, generator::FrameGenerator};
use std::sync::Arc;

/// Where a session's samples are read from
#[derive(Clone)]
pub enum Sources {
    /// One synthetic field, shared by every session key
    Demo(Arc<DemoStore>),
    /// One upstream store per session key over a shared HTTP client
    OpenF1(OpenF1Client),
    /// A fixed store regardless of session key
    Fixed(Arc<dyn SampleStore>),
}

impl Sources {
    pub fn store_for(&self, session: &str) -> Arc<dyn SampleStore> {
        match self {
            Sources::Demo(store) => store.clone(),
            Sources::OpenF1(client) => Arc::new(client.session(session)),
            Sources::Fixed(store) => store.clone(),
        }
    }
}

/// Shared application state
///
/// Holds no per-request or per-session data: every frame request builds a
/// fresh generator over the session's store.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sources: Sources,
}

impl AppState {
    pub fn new(config: ServerConfig, sources: Sources) -> Self {
        Self {
            config: Arc::new(config),
            sources,
        }
    }

    /// Build the sources named by `config`.
    pub fn from_config(config: ServerConfig) -> Result<Self, ReplayError> {
        let sources = match config.source {
            SourceKind::Demo => Sources::Demo(Arc::new(DemoStore::new(config.demo.clone()))),
            SourceKind::Openf1 => Sources::OpenF1(OpenF1Client::new(config.upstream.clone())?),
        };
        Ok(Self::new(config, sources))
    }

    /// Serve every session from `store` with default settings.
    pub fn with_store(store: Arc<dyn SampleStore>) -> Self {
        Self::new(ServerConfig::default(), Sources::Fixed(store))
    }

    pub fn generator(&self, session: &str) -> FrameGenerator {
        FrameGenerator::new(
            self.sources.store_for(session),
            self.config.generator.clone(),
        )
    }
}
