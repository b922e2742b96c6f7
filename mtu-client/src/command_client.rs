//! Command client: request/reply round trips against the hub's command server.
//!
//! Mirrors the command server's own worker-pool pattern: a caller enqueues a
//! request and immediately gets back a reply future, while a fixed-size pool
//! of workers takes turns driving the single underlying connection. Because
//! requests and replies share one socket, replies arrive in the same order
//! the requests were sent, so no reference-based reply matching is needed at
//! this layer (the combi client adds that on top, for async updates that
//! arrive on the separate publish channel).

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use mtu_shared::config::ClientConfig;
use mtu_shared::error::{MtuError, MtuResult};
use mtu_shared::framing::MtuCodec;
use mtu_shared::model::{
    Confirmation, ConfirmationResult, ConfirmationStatus, IecMsg, SubscriptionInitMsg,
};

/// Default number of workers driving the shared command connection.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 6;

struct Job {
    request: IecMsg,
    reply_tx: oneshot::Sender<IecMsg>,
}

/// A handle applications use to issue commands and await their replies.
///
/// Cloning is cheap: every clone shares the same worker pool and connection.
#[derive(Debug, Clone)]
pub struct CommandClient {
    subscriber_id: String,
    job_tx: mpsc::Sender<Job>,
    reply_timeout: Duration,
}

impl CommandClient {
    /// Connects to the hub's command server, performs the handshake, and
    /// starts the worker pool.
    pub async fn connect(config: &ClientConfig, worker_pool_size: usize) -> MtuResult<Self> {
        let stream = TcpStream::connect(config.command_server_addr()).await?;
        let mut framed = Framed::new(stream, MtuCodec::new());

        framed
            .send(IecMsg::SubscriptionInitMsg(SubscriptionInitMsg {
                requested_prefix: config.requested_prefix.clone(),
            }))
            .await?;
        let subscriber_id = match framed.next().await {
            Some(Ok(IecMsg::SubscriptionInitReply(reply))) => reply.subscriber_id,
            Some(Ok(_)) => {
                return Err(MtuError::InvalidHandshake(
                    "expected a subscription handshake reply".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(MtuError::InvalidHandshake(
                    "connection closed during handshake".to_string(),
                ))
            }
        };
        debug!(subscriber_id, "command client handshake complete");

        let reply_timeout = Duration::from_millis(config.command_reply_timeout_ms);
        let job_tx = spawn_worker_pool(framed, worker_pool_size.max(1), reply_timeout);

        Ok(Self {
            subscriber_id,
            job_tx,
            reply_timeout,
        })
    }

    /// The prefix the hub assigned this connection at handshake time. Used by
    /// the combi client to recognize which replies are ours.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Sends `request` and awaits its reply, resolved with a client-side
    /// [`ConfirmationStatus::ClientQueued`] sentinel if the round trip never
    /// completes within the reply timeout.
    pub async fn send(&self, request: IecMsg) -> MtuResult<IecMsg> {
        let reference_nr = request.reference_nr().map(str::to_string);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.job_tx
            .send(Job { request, reply_tx })
            .await
            .map_err(|_| MtuError::ChannelClosed("command worker pool".to_string()))?;

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MtuError::ChannelClosed("command connection".to_string())),
            Err(_) => {
                warn!(subscriber_id = self.subscriber_id, "command reply timed out, queuing locally");
                Ok(IecMsg::Confirmation(Confirmation::new(
                    ConfirmationResult {
                        status: Some(ConfirmationStatus::ClientQueued),
                        ..Default::default()
                    },
                    reference_nr.unwrap_or_default(),
                    0,
                )))
            }
        }
    }
}

fn spawn_worker_pool(
    framed: Framed<TcpStream, MtuCodec>,
    size: usize,
    reply_timeout: Duration,
) -> mpsc::Sender<Job> {
    let (tx, rx) = mpsc::channel(1024);
    let rx = Arc::new(AsyncMutex::new(rx));
    let conn = Arc::new(AsyncMutex::new(framed));
    for worker_id in 0..size {
        let rx = rx.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(job) = job else {
                    debug!(worker_id, "command client worker pool shutting down");
                    break;
                };
                let mut conn = conn.lock().await;
                if conn.send(job.request).await.is_err() {
                    break;
                }
                match tokio::time::timeout(reply_timeout, conn.next()).await {
                    Ok(Some(Ok(reply))) => {
                        let _ = job.reply_tx.send(reply);
                    }
                    Ok(Some(Err(e))) => {
                        warn!(worker_id, error = %e, "command connection decode error");
                        break;
                    }
                    Ok(None) => {
                        warn!(worker_id, "command connection closed by peer");
                        break;
                    }
                    Err(_) => {
                        // Dropping reply_tx here resolves the caller's future
                        // with a closed channel; send() reports that above.
                        warn!(worker_id, "no reply within the time budget");
                    }
                }
            }
        });
    }
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtu_shared::model::{ConfirmationStatus, ReadDatapoint, SubscriptionInitReply};
    use tokio::net::TcpListener;

    async fn fake_hub() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn handshake_and_single_round_trip() {
        let (listener, addr) = fake_hub().await;
        let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
        let config = ClientConfig {
            hub_ip: parts[1].to_string(),
            command_port: parts[0].parse().unwrap(),
            requested_prefix: "APP".to_string(),
            ..ClientConfig::default()
        };

        let server_task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, MtuCodec::new());
            match framed.next().await.unwrap().unwrap() {
                IecMsg::SubscriptionInitMsg(_) => {}
                _ => panic!("expected handshake"),
            }
            framed
                .send(IecMsg::SubscriptionInitReply(SubscriptionInitReply {
                    subscriber_id: "APP".to_string(),
                }))
                .await
                .unwrap();

            match framed.next().await.unwrap().unwrap() {
                IecMsg::ReadDatapoint(_) => {}
                _ => panic!("expected read request"),
            }
            framed
                .send(IecMsg::Confirmation(Confirmation::successful_send("APP_1", 1)))
                .await
                .unwrap();
        });

        let client = CommandClient::connect(&config, 2).await.unwrap();
        assert_eq!(client.subscriber_id(), "APP");

        let reply = client
            .send(IecMsg::ReadDatapoint(ReadDatapoint {
                coa: 1,
                ioa: 2,
                reference_nr: "APP_1".to_string(),
                max_tries: 1,
                queue_on_collision: false,
            }))
            .await
            .unwrap();
        match reply {
            IecMsg::Confirmation(c) => assert_eq!(c.result.status, Some(ConfirmationStatus::SuccessfulSend)),
            _ => panic!("expected confirmation"),
        }

        server_task.await.unwrap();
    }
}
