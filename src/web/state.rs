use std::path::PathBuf;
use std::sync::Arc;

use crate::ai::enricher::SchemaEnricher;
use crate::ai::{AiEngine, EngineLimits};
use crate::budget::TokenBudgetGuard;
use crate::cache::CacheProvider;
use crate::config::AppConfig;
use crate::db::{AppDb, ChatStore, ConnectionStore, OrganizationStore, SchemaManager};
use crate::llm::prompts::Prompts;
use crate::llm::LlmProvider;
use crate::query::{ConnectionManager, QueryExecutor};

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub engine: AiEngine,
    pub budget: Arc<TokenBudgetGuard>,
    pub organizations: Arc<OrganizationStore>,
    pub connections: Arc<ConnectionStore>,
    pub connection_manager: Arc<ConnectionManager>,
    pub schema_manager: Arc<SchemaManager>,
    pub chat_store: Arc<ChatStore>,
    pub enricher: SchemaEnricher,
    pub llm_backend: String,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: AppDb,
        provider: Arc<dyn LlmProvider>,
        cache: Arc<dyn CacheProvider>,
        data_dir: PathBuf,
    ) -> Self {
        let prompts = Arc::new(Prompts::new());
        let organizations = Arc::new(
            OrganizationStore::new(db.clone()).with_default_plan(config.budget.default_plan.clone()),
        );
        let budget = Arc::new(TokenBudgetGuard::new(organizations.clone()));
        let connections = Arc::new(ConnectionStore::new(db.clone()));
        let connection_manager = Arc::new(ConnectionManager::new(connections.clone(), data_dir));
        let schema_manager = Arc::new(SchemaManager::new(db.clone()));
        let chat_store = Arc::new(ChatStore::new(db));

        let mut engine = AiEngine::new(
            schema_manager.clone(),
            Arc::new(QueryExecutor::new(connection_manager.clone())),
            cache,
            chat_store.clone(),
            provider.clone(),
            prompts.clone(),
            EngineLimits::from(&config),
        );
        if config.budget.enabled {
            engine = engine.with_budget(budget.clone());
        }

        Self {
            llm_backend: provider.name().to_string(),
            enricher: SchemaEnricher::new(provider, prompts),
            config,
            engine,
            budget,
            organizations,
            connections,
            connection_manager,
            schema_manager,
            chat_store,
            startup_time: chrono::Utc::now(),
        }
    }
}
