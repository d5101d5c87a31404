use tokio::sync::mpsc;
use tracing::{error, info};

use smartgraph_core::error::Result;
use smartgraph_engine::{GraphEngine, RunStatus};

/// Forward every Ctrl-C to the returned channel for the life of the
/// process, so the prompt loop sees interrupts while reading input and
/// while a run is in flight.
pub fn interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Settle the outcome of a run for the prompt loop.
///
/// A cancelled or failed run keeps its pipeline state and goes back to
/// `prompt_node`; anything else passes through unchanged.
pub async fn recover(
    engine: &mut GraphEngine,
    outcome: Result<RunStatus>,
    prompt_node: &str,
) -> Result<RunStatus> {
    match outcome {
        Ok(RunStatus::Cancelled) => {
            println!("\n[interrupted]");
            info!(node = ?engine.current_node(), "Run interrupted, back to the prompt");
            engine.reset_cancellation();
            engine.rewind_to(prompt_node).await
        }
        Err(e) => {
            error!(node = ?e.node(), error = %e, "Run failed");
            eprintln!("[error: {}]", e);
            engine.reset_cancellation();
            engine.rewind_to(prompt_node).await
        }
        Ok(status) => Ok(status),
    }
}
