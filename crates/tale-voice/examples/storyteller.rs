//! Storyteller Demo: talk to the live storyteller from the terminal.
//!
//! Needs a microphone, speakers and `TALE_API_KEY` (or `GEMINI_API_KEY`) in
//! the environment or `.env`. Optional: `TALE_MODEL`, `TALE_VOICE`,
//! `TALE_ENDPOINT`, `RUST_LOG`.
//!
//! Press Ctrl+C to stop.

use anyhow::Context;
use tale_voice::{AudioCapture, LiveConfig, OrchestratorConfig, Speaker, Status, VoiceOrchestrator};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Rodio's output stream is not Send; keep everything on one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let live = LiveConfig::from_env().context("live service configuration")?;
    let mut orchestrator = VoiceOrchestrator::system(OrchestratorConfig::from_env(), live);

    match AudioCapture::list_input_devices() {
        Ok(devices) if devices.is_empty() => warn!("No input devices found"),
        Ok(devices) => info!("🎤 Input devices: {}", devices.join(", ")),
        Err(e) => warn!("Could not list input devices: {}", e),
    }

    info!("📖 Storyteller Demo. Speak to start a story. Press Ctrl+C to stop.");
    if let Err(e) = orchestrator.start().await {
        anyhow::bail!(
            "{} ({})",
            orchestrator.error_message().unwrap_or("Could not start"),
            e
        );
    }

    let mut shown = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping...");
                orchestrator.stop();
                break;
            }
            event = orchestrator.next_event() => {
                let Some(event) = event else { break };
                orchestrator.handle(event);

                let finalized = orchestrator.conversation().len()
                    - usize::from(orchestrator.conversation().has_open_user_turn());
                for turn in orchestrator.conversation().turns().skip(shown).take(finalized - shown) {
                    let who = match turn.speaker {
                        Speaker::User => "You",
                        Speaker::Ai => "Storyteller",
                    };
                    println!("[{}] {}: {}", turn.started_at.format("%H:%M:%S"), who, turn.text);
                }
                shown = finalized;
            }
        }
    }

    if orchestrator.status() == Status::Error {
        anyhow::bail!(orchestrator.error_message().unwrap_or("Session failed").to_string());
    }
    Ok(())
}
