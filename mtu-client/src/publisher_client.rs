//! Publisher client: subscribes to every message the hub broadcasts.
//!
//! Mirrors the original polling subscriber: connects with a bounded number
//! of retries, then forwards every frame it reads onto a bounded channel for
//! the application to drain at its own pace.

use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use mtu_shared::config::ClientConfig;
use mtu_shared::error::{MtuError, MtuResult};
use mtu_shared::framing::MtuCodec;
use mtu_shared::model::IecMsg;

/// Default number of connection attempts before giving up.
pub const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 20;
/// Delay between connection attempts.
pub const CONNECTION_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Capacity of the channel buffering received messages for the application.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A handle applications use to drain published messages.
#[derive(Debug)]
pub struct PublisherClient {
    updates: mpsc::Receiver<IecMsg>,
    _reader: tokio::task::JoinHandle<()>,
}

impl PublisherClient {
    /// Connects to the hub's publish server, retrying up to
    /// `max_connection_attempts` times, then starts forwarding every
    /// received message onto the internal queue.
    pub async fn connect(config: &ClientConfig, max_connection_attempts: u32) -> MtuResult<Self> {
        let addr = config.publish_server_addr();
        let stream = connect_with_retries(&addr, max_connection_attempts.max(1)).await?;
        let framed = Framed::new(stream, MtuCodec::new());

        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let reader = tokio::spawn(drain_into_queue(framed, tx));

        Ok(Self {
            updates: rx,
            _reader: reader,
        })
    }

    /// Whether a message is already buffered and ready without waiting.
    #[must_use]
    pub fn has_update(&self) -> bool {
        !self.updates.is_empty()
    }

    /// Waits up to `timeout` for the next published message.
    pub async fn get_update(&mut self, timeout: Duration) -> Option<IecMsg> {
        tokio::time::timeout(timeout, self.updates.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits indefinitely for the next published message, returning `None`
    /// once the connection has closed and every buffered message has drained.
    pub async fn next_update(&mut self) -> Option<IecMsg> {
        self.updates.recv().await
    }
}

async fn drain_into_queue(mut framed: Framed<TcpStream, MtuCodec>, tx: mpsc::Sender<IecMsg>) {
    loop {
        match framed.next().await {
            Some(Ok(msg)) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "publish connection decode error");
                break;
            }
            None => {
                debug!("publish connection closed by peer");
                break;
            }
        }
    }
}

async fn connect_with_retries(addr: &str, max_attempts: u32) -> MtuResult<TcpStream> {
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!(addr, attempt, "publish client connected");
                return Ok(stream);
            }
            Err(e) => {
                warn!(addr, attempt, max_attempts, error = %e, "publish connection attempt failed");
                last_err = Some(e);
                tokio::time::sleep(CONNECTION_RETRY_DELAY).await;
            }
        }
    }
    Err(MtuError::Io(last_err.expect("max_attempts is at least 1")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use mtu_shared::model::Confirmation;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn receives_every_broadcast_message_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
        let config = ClientConfig {
            hub_ip: parts[1].to_string(),
            publish_port: parts[0].parse().unwrap(),
            ..ClientConfig::default()
        };

        let server_task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, MtuCodec::new());
            framed
                .send(IecMsg::Confirmation(Confirmation::successful_send("MTU_1", 0)))
                .await
                .unwrap();
            framed
                .send(IecMsg::Confirmation(Confirmation::successful_send("MTU_2", 0)))
                .await
                .unwrap();
        });

        let mut client = PublisherClient::connect(&config, 3).await.unwrap();
        let first = client.next_update().await.unwrap();
        let second = client.next_update().await.unwrap();
        assert_eq!(first.reference_nr(), Some("MTU_1"));
        assert_eq!(second.reference_nr(), Some("MTU_2"));

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn get_update_times_out_when_nothing_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
        let config = ClientConfig {
            hub_ip: parts[1].to_string(),
            publish_port: parts[0].parse().unwrap(),
            ..ClientConfig::default()
        };

        let _keep_alive = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = PublisherClient::connect(&config, 3).await.unwrap();
        assert!(!client.has_update());
        let update = client.get_update(Duration::from_millis(50)).await;
        assert!(update.is_none());
    }
}
