use std::sync::Arc;

use typerush::auth::GuestAuthenticator;
use typerush::config;
use typerush::directory::MemoryDirectory;
use typerush::server::{self, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    config::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "5000".to_string())
        .parse()
        .expect("Invalid PORT");

    let passages = Arc::new(config::load_passages());
    tracing::info!("Loaded {} race passages", passages.len());

    let state = AppState::new(
        Arc::new(MemoryDirectory::new()),
        Arc::new(GuestAuthenticator::new()),
        passages,
    );

    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("Typerush server running on port {}", port);

    axum::serve(listener, app).await.unwrap();
}
