//! # souk-console
//!
//! Headless console: signs in one operator, keeps the live connection up
//! and prints every UI event until Ctrl+C. Side effects only write logs.

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use souk_client::{ClientConfig, Collaborators, Session, UiEvent};
use souk_shared::constants::APP_NAME;
use souk_shared::Identity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    souk_client::init_tracing();
    info!("Starting {} console v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and identity
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let user_id = std::env::var("SOUK_USER_ID").context("SOUK_USER_ID must be set")?;
    let token = std::env::var("SOUK_TOKEN").ok().filter(|t| !t.is_empty());
    let identity = Identity::new(user_id, token);

    // -----------------------------------------------------------------------
    // 3. Start the session
    // -----------------------------------------------------------------------
    let collaborators = Collaborators::from_config(&config);
    let session = Session::start(config, identity, collaborators).await;
    let mut events = session.subscribe_ui();

    // -----------------------------------------------------------------------
    // 4. Print UI events until Ctrl+C
    // -----------------------------------------------------------------------
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "UI event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!("Interrupted");
                break;
            }
        }
    }

    session.shutdown().await;
    info!("Console stopped");
    Ok(())
}

fn print_event(event: &UiEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Failed to render UI event"),
    }
}
