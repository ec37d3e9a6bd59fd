use anyhow::Result;
use intersection_control::config::Config;
use intersection_control::pipeline::ControlLoop;
use intersection_control::synthetic::SyntheticBackend;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "intersection_control=info".to_string()),
        )
        .init();

    info!("🚦 Adaptive Intersection Control starting");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load_or_default(&config_path)?;
    info!("✓ Configuration loaded from {config_path}");

    // Wire the control loop to the built-in synthetic simulator
    let backend = SyntheticBackend::new(config.simulator.clone());
    let (control_loop, handle) = ControlLoop::new(config, Box::new(backend));
    let loop_task = tokio::spawn(control_loop.run());

    handle.start().await?;
    info!("✓ Simulation running (ctrl-c to stop)");

    // Follow the snapshot stream until interrupted
    let mut stream = handle.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            snapshot = stream.recv() => match snapshot {
                Ok(snapshot) => {
                    if snapshot.time % 5 == 0 {
                        info!(
                            "t={:>4}s green={:<4} [{}] {}",
                            snapshot.time,
                            snapshot.signal.green_approach,
                            snapshot.decision.method.as_str(),
                            snapshot.decision.reason,
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    info!("observer lagged, skipped {skipped} snapshots");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    if let Err(e) = handle.stop().await {
        error!("stop failed: {e}");
    }
    let _ = handle.shutdown().await;
    let _ = loop_task.await;

    info!("🏁 Shut down cleanly");
    Ok(())
}
