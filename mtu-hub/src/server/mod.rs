//! TCP front door: the command server (request/reply) and the publish
//! server (one-way broadcast) that subscriber applications connect to.

pub mod command_server;
pub mod publish_server;

pub use command_server::CommandServer;
pub use publish_server::PublishServer;

use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, warn};

/// Binds `addr`, retrying up to `max_attempts` times with a short backoff.
/// A bind failure that survives every attempt is treated as fatal, matching
/// the original ZMQ servers' bind-retry-then-abort behavior.
pub async fn bind_with_retries(addr: &str, max_attempts: u32) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for attempt in 1..=max_attempts.max(1) {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!(addr, attempt, max_attempts, error = %e, "bind attempt failed");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
    let err = last_err.expect("max_attempts is at least 1");
    error!(addr, "exhausted bind attempts, giving up");
    Err(err)
}
