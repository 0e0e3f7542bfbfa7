//! Conversational document question answering server
//!
//! (c) Softlandia 2025

use doc_chat_api::api;
use doc_chat_api::core::engine::DocumentChatEngineFactory;
use doc_chat_api::core::engine::index::IndexBuilder;
use doc_chat_api::core::engine::storage::StorageContextCache;
use doc_chat_api::core::services::DbConversationService;
use doc_chat_api::infrastructure::database::DatabaseConnection;
use doc_chat_api::infrastructure::openai::{OpenAiClient, OpenAiEmbeddings};
use doc_chat_api::infrastructure::repositories::DbConversationRepository;
use doc_chat_api::infrastructure::settings::Settings;
use doc_chat_api::infrastructure::vector_store::FileVectorStore;

use anyhow::{Context, anyhow};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use di::{Injectable, ServiceCollection};
use di_axum::RouterServiceProviderExtensions;
use log::info;
use tokio::runtime::{Builder, Runtime};
use tower_http::cors::{Any, CorsLayer};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env().context("invalid configuration")?;

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(web_server_task(settings))?;

    info!("Shutting down...");
    Ok(())
}

async fn web_server_task(settings: Settings) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&settings.upload_dir).await?;
    tokio::fs::create_dir_all(&settings.persist_dir).await?;

    let provider = ServiceCollection::new()
        .add(Settings::singleton())
        .add(DatabaseConnection::singleton())
        .add(OpenAiClient::singleton())
        .add(OpenAiEmbeddings::singleton())
        .add(FileVectorStore::singleton())
        .add(StorageContextCache::singleton())
        .add(IndexBuilder::singleton())
        .add(DbConversationRepository::scoped())
        .add(DbConversationService::scoped())
        .add(DocumentChatEngineFactory::scoped())
        .build_provider()
        .map_err(|e| anyhow!("invalid service registrations: {e}"))?;

    if settings.run_migrations {
        let connection = provider.get_required::<DatabaseConnection>();
        connection.migrate().await.context("failed to run migrations")?;
        info!("database migrations applied");
    }

    let origins = settings
        .cors_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid CORS_ORIGINS")?;

    // build our application with a route
    let app = Router::new()
        .nest("/api", api::router())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_origin(origins),
        )
        .with_provider(provider);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
