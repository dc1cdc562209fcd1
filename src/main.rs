use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use grotto::config::Config;
use grotto::connection;
use grotto::keys::RelayKeys;
use grotto::relay::Relay;
use grotto::store::{MemoryStore, PostgresStore, Store};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = Config::from_env().expect("invalid configuration");

    let keys = match &config.secret_key {
        Some(secret) => RelayKeys::from_secret_hex(secret).expect("invalid RELAY_SECRET_KEY"),
        None => {
            info!("RELAY_SECRET_KEY not set, generating an ephemeral relay key");
            RelayKeys::generate()
        }
    };
    info!("relay pubkey: {}", keys.public_key());

    let relay = match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(50)
                .connect(&url)
                .await
                .expect("Failed to connect to database");
            let store = Arc::new(PostgresStore::new(pool));
            store.init().await.expect("failed to set up database schema");
            Relay::new(config.clone(), keys, store.clone(), store)
        }
        None => {
            warn!("DATABASE_URL not set, falling back to the in-memory store");
            let store = Arc::new(MemoryStore::new());
            Relay::new(config.clone(), keys, store.clone(), store)
        }
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/nostr.json", get(info_document))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(relay);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid RELAY_HOST/RELAY_PORT");
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.unwrap();
}

/// WebSocket upgrade, NIP-11 on `Accept: application/nostr+json`, plain
/// greeting otherwise.
async fn root(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(relay): State<Arc<Relay>>,
) -> Response {
    if let Some(ws) = ws {
        return ws
            .on_upgrade(move |socket| connection::serve_socket(relay, socket))
            .into_response();
    }

    if let Some(accept) = headers.get("accept") {
        if accept
            .to_str()
            .unwrap_or("")
            .contains("application/nostr+json")
        {
            return Json(relay.info_document()).into_response();
        }
    }

    "Welcome to grotto".into_response()
}

async fn info_document(State(relay): State<Arc<Relay>>) -> Json<serde_json::Value> {
    Json(relay.info_document())
}
