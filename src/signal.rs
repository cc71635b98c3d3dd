//! Operator interrupt (Ctrl+C) handling
//!
//! The interrupt is broadcast through a `watch` channel so every wait in a
//! session can race it against its own completion.

use tokio::sync::watch;
use tracing::{debug, warn};

/// Install the Ctrl+C handler and return the receiving side of the signal
pub fn install_interrupt_handler() -> Result<watch::Receiver<bool>, ctrlc::Error> {
    let (tx, rx) = watch::channel(false);

    ctrlc::set_handler(move || {
        if tx.send_replace(true) {
            debug!("Interrupt already in progress");
        } else {
            warn!("Interrupted, cleaning up...");
        }
    })?;

    Ok(rx)
}

/// Resolves once an interrupt has been signalled
///
/// Never resolves if the sending side is gone without having signalled.
pub async fn interrupted(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}
