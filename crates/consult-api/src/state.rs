//! Application state wiring the chat subsystem together.
//!
//! The orchestrator is generic over its stores; AppState pins it to the
//! SQLite implementations from consult-infra.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use consult_core::chat::orchestrator::ChatOrchestrator;
use consult_core::chat::reaper::SessionReaper;
use consult_core::health::monitor::HealthMonitor;
use consult_core::llm::box_backend::BoxGenerationBackend;
use consult_core::llm::synthesizer::ResponseSynthesizer;
use consult_core::transport::registry::ConnectionRegistry;
use consult_infra::config::generation_api_key;
use consult_infra::llm::create_backend;
use consult_infra::sqlite::api_key::SqliteTokenVerifier;
use consult_infra::sqlite::chat::{SqliteMessageLog, SqliteSessionStore};
use consult_infra::sqlite::pool::DatabasePool;
use consult_types::config::GlobalConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Orchestrator pinned to the SQLite stores.
pub type ConcreteOrchestrator = ChatOrchestrator<SqliteSessionStore, SqliteMessageLog>;

/// Shared application state. Used by CLI commands and HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub verifier: Arc<SqliteTokenVerifier>,
    pub config: Arc<GlobalConfig>,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Open the database under `data_dir` (unless the config names one) and
    /// wire the orchestrator with the configured generation backend.
    pub async fn init(config: GlobalConfig, data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let db_url = database_url(&config, data_dir);
        let db_pool = DatabasePool::new(&db_url).await?;
        tracing::debug!(url = %db_url, "Database ready");

        let backend = create_backend(&config.generation, generation_api_key());
        Ok(Self::from_parts(db_pool, config, backend))
    }

    /// Wire state around an open pool and an explicit backend.
    pub fn from_parts(db_pool: DatabasePool, config: GlobalConfig, backend: BoxGenerationBackend) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.chat.negotiator.clone()));
        let health = Arc::new(HealthMonitor::new(&config.health));
        let synthesizer = ResponseSynthesizer::new(backend, config.generation.clone());
        tracing::info!(
            backend = synthesizer.backend_name(),
            model = %config.generation.model,
            "Generation backend selected"
        );

        let orchestrator = ChatOrchestrator::new(
            SqliteSessionStore::new(db_pool.clone()),
            SqliteMessageLog::new(db_pool.clone()),
            synthesizer,
            registry,
            health,
            config.chat.cancel_grace(),
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            verifier: Arc::new(SqliteTokenVerifier::new(db_pool.clone())),
            config: Arc::new(config),
            db_pool,
        }
    }

    /// Start the idle/close sweep in the background until `cancel` fires.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let reaper = SessionReaper::new(self.orchestrator.clone(), self.config.sessions.clone());
        tokio::spawn(reaper.run(cancel))
    }
}

/// The configured database URL, or `consult.db` inside `data_dir`.
pub fn database_url(config: &GlobalConfig, data_dir: &Path) -> String {
    config.server.database_url.clone().unwrap_or_else(|| {
        format!("sqlite://{}?mode=rwc", data_dir.join("consult.db").display())
    })
}

/// `config.toml` inside `data_dir`.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}
