//! Banter - local-first AI chat service
//!
//! Persists multi-turn conversations in SQLite and delegates replies to an
//! OpenAI-compatible completion API. The HTTP surface is a thin consumer of
//! the projected chat state.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;

use crate::config::Config;
use crate::core::{ChatService, ChatStore, StateProjector};
use crate::providers::{OpenAiConfig, OpenAiProvider};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub projector: Arc<StateProjector>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let store = ChatStore::new(&config.data_dir.join("banter.db")).await?;

    let provider = Arc::new(OpenAiProvider::new(OpenAiConfig {
        base_url: config.openai_base_url.clone(),
        api_key: config.openai_api_key.clone(),
        model: config.model.clone(),
        ..OpenAiConfig::default()
    }));

    let service = Arc::new(ChatService::new(store, provider));
    let projector = StateProjector::new(service).await?;

    let state = AppState { projector };

    let app = routes::router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Banter running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
