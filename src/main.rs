//! notefed binary entry point
//!
//! `notefed` serves HTTP; `notefed register <username> [display name]`
//! creates a local actor and exits.

use notefed::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Initialize metrics
/// 3. Load configuration from file and environment
/// 4. Initialize AppState
/// 5. Resume pending deliveries
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("NOTEFED__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "notefed=info,tower_http=debug".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    // 2. Initialize metrics
    notefed::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(command) = args.first() {
        return run_command(&state, command, &args[1..]).await;
    }

    // 5. Resume pending deliveries
    if config.federation.delivery.resume_on_startup {
        let resumed = state.delivery.resume_pending().await?;
        tracing::info!(resumed, "Delivery queue resumed");
    }

    // 6. Start HTTP server
    let app = notefed::build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_command(
    state: &AppState,
    command: &str,
    args: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    match (command, args) {
        ("register", [username, display_name @ ..]) => {
            let display_name = display_name.join(" ");
            let display_name = (!display_name.is_empty()).then_some(display_name.as_str());
            let actor = state.accounts.register(username, display_name).await?;
            println!("{}", actor.iri);
            Ok(())
        }
        _ => Err(format!(
            "unknown command: {} (usage: notefed [register <username> [display name]])",
            command
        )
        .into()),
    }
}
