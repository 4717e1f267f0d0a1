//! reqmas command-line driver.
//!
//! Reads a session (specifications, optional budget, expertise and session
//! id) as JSON, runs it through the validation pipeline and prints the
//! solution summary.
//!
//! # Environment Variables
//!
//! - `REQMAS_CONFIG`: settings file (YAML or JSON)
//! - `REQMAS_CATALOG`: catalog file, overrides `catalog_path`
//! - `RUST_LOG`: tracing filter (default: "info,reqmas=debug")
//!
//! # Usage
//!
//! ```bash
//! reqmas session.json
//! cat session.json | reqmas
//! ```

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use uuid::Uuid;

use reqmas::blackboard::{Blackboard, KnowledgeSpace, MergePolicy};
use reqmas::catalog::Catalog;
use reqmas::config::Settings;
use reqmas::events::MessageBus;
use reqmas::validation::{SessionData, ValidationPipeline};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqmas=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::load().context("loading settings")?;
    let catalog = match &settings.catalog_path {
        Some(path) => Catalog::from_file(path).context("loading catalog")?,
        None => Catalog::default(),
    };

    let session = read_session().context("reading session")?;
    let session_id = session
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::info!(
        "Validating session {} with {} specifications",
        session_id,
        session.specifications.len()
    );

    let blackboard = Blackboard::with_policy(MergePolicy::from_priorities(
        &settings.blackboard.agent_priorities,
    ));
    let bus = MessageBus::new(settings.message_bus.clone());
    bus.start().context("starting message bus")?;

    for spec in &session.specifications {
        blackboard
            .write_entry("user", KnowledgeSpace::Raw, &spec.constraint, serde_json::to_value(spec)?)
            .await;
    }
    blackboard
        .write_entry("user", KnowledgeSpace::Consolidated, "session_id", json!(session_id))
        .await;

    let pipeline = ValidationPipeline::new(Arc::new(catalog), settings.pipeline.clone());
    let summary = pipeline.validate_complete_solution(&session).await;
    let summary_value = serde_json::to_value(&summary)?;

    blackboard
        .write_entry("orchestrator", KnowledgeSpace::Validated, &session_id, summary_value.clone())
        .await;
    if let Err(e) = bus.publish(
        "orchestrator",
        "validation_complete",
        json!({ "session_id": session_id, "valid": summary.valid, "confidence": summary.confidence }),
        None,
    ) {
        tracing::warn!("Could not publish validation_complete: {}", e);
    }
    bus.flush(Duration::from_secs(1)).await;
    bus.stop().await;

    println!("{}", serde_json::to_string_pretty(&summary_value)?);
    Ok(())
}

fn read_session() -> Result<SessionData> {
    let raw = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    serde_json::from_str(&raw).context("parsing session JSON")
}
