use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use relay_app::{config, persistence, replay};
use relay_engine::{ensure_state_dir, SyncEngine};
use relay_logging::{relay_error, relay_info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config::config_path();
    let (config, source) = config::load(&config_path);
    relay_logging::initialize(
        config.log_destination,
        relay_logging::parse_level(&config.log_level),
        &config.log_file(),
    );
    config::report(&config_path, &source);

    let recording = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| config.replay.clone())
        .context("usage: relay_app <recording.jsonl> (or set `replay` in relay.ron)")?;
    let steps = replay::load_recording(&recording)
        .with_context(|| format!("cannot load recording {}", recording.display()))?;

    let state_dir = config.state_dir.clone();
    if let Err(err) = ensure_state_dir(&state_dir) {
        relay_error!("state directory unavailable: {}", err);
    }

    let backend = Arc::new(replay::ReplayBackend::new());
    let engine = SyncEngine::new(backend.clone(), config.engine_settings());
    let restored = engine.load_cards(persistence::load_cards(&state_dir));
    relay_info!("restored {} overview card(s)", restored);

    let outcome = replay::run(&engine, &backend, steps).await;
    relay_info!(
        "replayed {} step(s), {} rejected",
        outcome.steps,
        outcome.rejected.len()
    );

    println!("phase: {}", engine.phase());
    if let Some(summary) = engine.summary() {
        println!("summary: {}", serde_json::to_string_pretty(&summary)?);
    }
    for card in engine.cards() {
        println!(
            "card {} {} {:?} {:.0}%",
            card.id,
            card.url,
            card.status,
            card.progress * 100.0
        );
    }
    for (url, record) in engine.all_progress() {
        println!("progress {} {:?} {}", url, record.status, record.downloaded);
    }

    persistence::save_cards(&state_dir, &engine.stored_cards());
    engine.shutdown();
    Ok(())
}
