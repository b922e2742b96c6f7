//! Publish server: one-way broadcast TCP socket. Every connected subscriber
//! receives every message the hub publishes, in the order it was produced;
//! there is no per-subscriber filtering or handshake on this channel.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mtu_shared::framing::MtuCodec;
use mtu_shared::model::SubscriptionPolicy;

use crate::subscription::SubscriberRegistry;

/// The publish (broadcast) TCP front door.
#[derive(Debug)]
pub struct PublishServer {
    subscribers: Arc<SubscriberRegistry>,
}

impl PublishServer {
    #[must_use]
    pub fn new(subscribers: Arc<SubscriberRegistry>) -> Self {
        Self { subscribers }
    }

    /// Accepts connections until `stop` fires, serving each on its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener, stop: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "publish server listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.serve_connection(socket, addr).await; });
                        }
                        Err(e) => warn!(error = %e, "publish server accept failed"),
                    }
                }
                () = stop.cancelled() => {
                    info!("publish server shutting down");
                    break;
                }
            }
        }
    }

    async fn serve_connection(&self, socket: TcpStream, addr: SocketAddr) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let Some(subscriber_id) = self.subscribers.register("PUB", SubscriptionPolicy::default(), tx) else {
            warn!(?addr, "publish registry rejected connection");
            return;
        };
        debug!(?addr, subscriber_id, "publish channel connected");

        let mut framed = Framed::new(socket, MtuCodec::new());
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if framed.send(msg).await.is_err() {
                        break;
                    }
                }
                // The channel is one-way, but a closed read half still
                // signals the peer dropped the connection.
                frame = framed.next() => {
                    if frame.is_none() {
                        break;
                    }
                }
            }
        }

        self.subscribers.deregister(&subscriber_id);
        debug!(subscriber_id, "publish channel disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtu_shared::model::{Confirmation, IecMsg};

    #[tokio::test]
    async fn broadcast_message_reaches_connected_subscriber() {
        let subscribers = SubscriberRegistry::new();
        let server = Arc::new(PublishServer::new(subscribers.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        let server_task = {
            let server = server.clone();
            let stop = stop.clone();
            tokio::spawn(async move { server.run(listener, stop).await })
        };

        let client = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(client, MtuCodec::new());

        // give the accept loop a beat to register the connection
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(subscribers.len(), 1);

        let msg = IecMsg::Confirmation(Confirmation::successful_send("MTU_1", 0));
        subscribers.broadcast(&msg, |_, _| true);

        let received = framed.next().await.unwrap().unwrap();
        assert_eq!(received.reference_nr(), Some("MTU_1"));

        stop.cancel();
        server_task.abort();
    }
}
