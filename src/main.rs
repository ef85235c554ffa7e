use axum::{http::HeaderValue, Extension, Router};
use dermadoc::{
    config::Settings,
    db,
    gemini_client::GeminiClient,
    handlers, middleware,
    services::classifier::{Classifier, RemoteClassifier},
    storage::ImageStorage,
    AppState,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    let settings = Settings::from_env().expect("Invalid configuration");

    let storage = ImageStorage::new(&settings.storage_root).expect("Failed to prepare storage directory");
    tracing::info!("Storage ready at {}", storage.root().display());

    let db_pool = db::create_pool(&settings.database_url)
        .await
        .expect("Failed to create database pool.");

    let gemini_client = match &settings.gemini_api_key {
        Some(api_key) => {
            tracing::info!(
                "Gemini API key configured ({} characters), model {}",
                api_key.len(),
                settings.gemini_model
            );
            Some(GeminiClient::new(api_key.clone(), settings.gemini_model.clone()))
        }
        None => {
            tracing::warn!("GEMINI_API_KEY not found. Chat endpoints will answer 503.");
            None
        }
    };

    let classifier: Option<Arc<dyn Classifier>> = match &settings.classifier_url {
        Some(url) => {
            tracing::info!("Using inference service at {}", url);
            Some(Arc::new(RemoteClassifier::new(url.clone())))
        }
        None => {
            tracing::warn!("CLASSIFIER_URL not set. Uploaded images will be marked as failed.");
            None
        }
    };

    let cors = CorsLayer::new()
        .allow_origin(
            settings
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        )
        .allow_methods(Any)
        .allow_headers(Any);

    let bind_addr = settings.bind_addr.clone();
    let shared_state = Arc::new(AppState {
        db_pool,
        settings,
        storage,
        gemini_client,
        classifier,
    });

    let app = Router::new()
        .merge(handlers::auth::auth_routes())
        .merge(handlers::chat::chat_routes())
        .merge(handlers::skin_check::skin_check_routes())
        .merge(handlers::storage::storage_routes())
        .route("/", axum::routing::get(root))
        .route("/health", axum::routing::get(health_check))
        .layer(axum::middleware::from_fn(middleware::logging::request_logging_middleware))
        .layer(cors)
        .layer(Extension(shared_state));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind listener");
    tracing::info!("listening on {}", bind_addr);
    axum::serve(listener, app).await.expect("Server error");
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,dermadoc=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,dermadoc=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();

    tracing::info!("DermaDoc API starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Build mode: {}", if cfg!(debug_assertions) { "development" } else { "production" });
    tracing::info!("Log level: {}", log_level);

    Ok(())
}

async fn root() -> axum::response::Json<serde_json::Value> {
    axum::response::Json(json!({ "message": "DermaDoc API is running" }))
}

async fn health_check() -> axum::response::Json<serde_json::Value> {
    axum::response::Json(json!({ "status": "healthy" }))
}
