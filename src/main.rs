use std::sync::Arc;

use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use newsdesk::config::Config;
use newsdesk::db::Database;
use newsdesk::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "newsdesk=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = Config::load_or_default("newsdesk.toml")?;
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database_url = url;
    }
    let media_base = config.media_base()?;
    info!(media_url = %media_base, media_dir = %config.media_dir, "Loaded configuration");

    // Initialize database
    let db = Database::new(&config.database_url).await?;
    db.initialize().await?;
    info!("Database initialized");

    let state = Arc::new(AppState {
        db: Arc::new(db),
        media_base,
    });

    let app = routes::router(state).nest_service("/media", ServeDir::new(&config.media_dir));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Server starting on http://{}", config.listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
