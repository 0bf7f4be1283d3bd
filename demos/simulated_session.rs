//! Simulated Session Demonstration
//!
//! Runs a twelve second session against the simulated wave field, prints the
//! reflection estimate of every analysis block as it arrives and summarises
//! the session artifact at the end.
//!
//! Run with: cargo run --example simulated_session

use anyhow::Result;
use std::time::Duration;
use wave_daq::{
    bus::{BusEvent, Topic},
    config::AppConfig,
    logging, AcquisitionController, SessionConfig, SessionState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = AppConfig::default();
    config.simulation.seed = Some(7);
    logging::init_from_config(&config)?;

    let controller = AcquisitionController::new(&config);
    controller.bus().subscribe(
        Topic::ReflectionResult,
        "demo-printer",
        |event| {
            if let BusEvent::ReflectionResult { frames, result, .. } = event {
                println!(
                    "   frames {}..={}: Kr = {}, Hm0 incident {:.4} m, reflected {:.4} m",
                    frames.first,
                    frames.last,
                    result
                        .kr
                        .map_or_else(|| "n/a".to_string(), |kr| format!("{:.3}", kr)),
                    result.incident.hm0,
                    result.reflected.hm0,
                );
            }
            Ok(())
        },
    )?;

    println!("=== Simulated Session Demonstration ===\n");
    let mut session = SessionConfig {
        sample_rate: 256.0,
        duration_secs: Some(12.0),
        ..SessionConfig::default()
    };
    session.analysis.block_len = 1024;

    let id = controller.configure(session)?;
    controller.start(id).await?;
    println!("1. Session {} started", id);

    while controller.get_status(id)?.state == SessionState::Running {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    controller.stop(id).await?;

    let status = controller.get_status(id)?;
    println!(
        "\n2. Session ended in {}: {} frames, {:.2} Hz measured, {} dropped",
        status.state, status.frames_acquired, status.actual_rate, status.dropped_frame_count
    );

    let artifact = controller.take_artifact(id)?;
    println!(
        "3. Artifact: {} frames recorded, {} analysis blocks, simulated = {}",
        artifact.recording.frames.len(),
        artifact.recording.analysis_blocks,
        artifact.simulated
    );

    controller.shutdown().await;
    Ok(())
}
