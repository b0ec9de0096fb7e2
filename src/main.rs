use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use chat_stream::agent::{GeminiClient, GenerationClient, OllamaAgentService};
use chat_stream::config::{AppConfig, Backend};
use chat_stream::db::{ConversationStore, InMemoryConversationStore, PgConversationStore};
use chat_stream::routes;
use chat_stream::service::{ChatService, ChatSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_stream=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env();

    // ── Storage ───────────────────────────────────────────────────────────────
    let store: Arc<dyn ConversationStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;
            info!("Database connection established and migrations applied");
            Arc::new(PgConversationStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, conversations are kept in memory");
            Arc::new(InMemoryConversationStore::new())
        }
    };

    // ── Generation backend ────────────────────────────────────────────────────
    let client: Arc<dyn GenerationClient> = match config.backend {
        Backend::Gemini => {
            if config.gemini.api_key.is_empty() {
                warn!("GEMINI_API_KEY not set, sends will be rejected");
            }
            Arc::new(GeminiClient::new(config.gemini.clone())?)
        }
        Backend::Ollama => Arc::new(OllamaAgentService::new(
            &config.ollama_base_url,
            config.model.as_deref(),
        )?),
    };
    info!(backend = client.backend(), model = client.model(), "generation client ready");

    let chat_service = ChatService::new(
        store,
        client,
        ChatSettings {
            system_instruction: config.system_instruction.clone(),
            default_params: config.default_params.clone(),
        },
    );

    // ── Router ────────────────────────────────────────────────────────────────
    let app = routes::router(chat_service)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
