use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use maildrip::config::Config;
use maildrip::crypto::TokenVault;
use maildrip::dispatcher::Dispatcher;
use maildrip::establish_connection;
use maildrip::inbox::InboxInjector;
use maildrip::mail::SendGridClient;
use maildrip::oauth::OAuthClient;
use maildrip::{api, verifier, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;
    let port = config.port;

    tracing::info!("Starting maildrip on port {port}");

    // Connect to database; schema DDL is idempotent
    let db = establish_connection(&config.database_url).await?;
    let db = Arc::new(db);

    let vault = TokenVault::from_env()?.map(Arc::new);

    let config = Arc::new(config);
    let oauth = Arc::new(OAuthClient::from_config(&config)?);
    let sendgrid = Arc::new(SendGridClient::new(
        config.sendgrid_api_key.clone(),
        config.sendgrid_validation_key.clone(),
        config.send_rate_limit_per_minute,
        config.send_burst_limit,
    )?);
    let injector = Arc::new(InboxInjector::new(
        db.clone(),
        vault.clone(),
        oauth.clone(),
        sendgrid.clone(),
        config.clone(),
    )?);

    let state = AppState {
        db: db.clone(),
        config: config.clone(),
        vault,
        oauth,
        sendgrid: sendgrid.clone(),
        injector,
    };

    // Built-in verify+send ticker so a single process works without an
    // external cron. Refresh and the daily validation pass still arrive
    // through the action endpoint.
    if config.tick_seconds > 0 {
        let ticker_db = db.clone();
        let ticker_sendgrid = sendgrid.clone();
        let ticker_config = config.clone();
        let tick_seconds = config.tick_seconds;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(tick_seconds));
            tracing::info!("Dispatch ticker started (every {tick_seconds}s)");

            loop {
                interval.tick().await;
                let now = chrono::Utc::now();

                match verifier::run_verification_pass(&ticker_db, now).await {
                    Ok(outcome) if outcome.examined > 0 => {
                        tracing::debug!(
                            verified = outcome.verified,
                            cancelled = outcome.cancelled,
                            "Ticker verification pass"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Ticker verification pass failed: {e}"),
                }

                let dispatcher = Dispatcher::new(
                    ticker_db.clone(),
                    ticker_sendgrid.clone(),
                    ticker_config.clone(),
                );
                match dispatcher.run_dispatch_pass(now).await {
                    Ok(outcome) if outcome.examined > 0 => {
                        tracing::debug!(
                            sent = outcome.sent,
                            failed = outcome.failed,
                            "Ticker dispatch pass"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Ticker dispatch pass failed: {e}"),
                }
            }
        });
    }

    // Webhooks and OAuth callbacks come from browsers and providers alike
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = api::create_router().layer(cors).with_state(state);

    // Start server
    let listener = TcpListener::bind(&format!("0.0.0.0:{port}")).await?;

    println!("maildrip server listening on http://0.0.0.0:{port}");

    // Setup graceful shutdown
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        tracing::info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("Application shutdown complete");
    Ok(())
}
