//! Combi client: composes the command and publisher clients, routing
//! asynchronous updates that relate to a prior command back to that
//! command's own callback instead of the general-purpose update callback.
//!
//! A reference number is only ever recognized as "ours" when it starts with
//! the prefix the hub assigned this connection at handshake time; everything
//! else on the publish channel goes to `on_update`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use mtu_shared::config::ClientConfig;
use mtu_shared::error::MtuResult;
use mtu_shared::model::{ConfirmationStatus, IecMsg};

use crate::command_client::CommandClient;
use crate::publisher_client::PublisherClient;

/// Callback invoked with every asynchronous update correlated to an
/// outstanding command (e.g. the ACT_TERM that follows a positive confirmation).
pub type CommandCallback = Box<dyn Fn(IecMsg) + Send + Sync>;

/// Composes a [`CommandClient`] and a [`PublisherClient`].
#[derive(Clone)]
pub struct CombiClient {
    commands: CommandClient,
    outstanding: Arc<Mutex<HashMap<String, Arc<CommandCallback>>>>,
}

impl std::fmt::Debug for CombiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombiClient")
            .field("subscriber_id", &self.commands.subscriber_id())
            .finish()
    }
}

impl CombiClient {
    /// Connects both the command and publisher channels, then spawns the
    /// task that drains the publisher and routes each message to an
    /// outstanding command's callback, or to `on_update` for everything else.
    pub async fn connect(
        config: &ClientConfig,
        worker_pool_size: usize,
        max_connection_attempts: u32,
        on_update: impl Fn(IecMsg) + Send + Sync + 'static,
    ) -> MtuResult<Self> {
        let commands = CommandClient::connect(config, worker_pool_size).await?;
        let mut publisher = PublisherClient::connect(config, max_connection_attempts).await?;
        let subscriber_id = commands.subscriber_id().to_string();
        let outstanding: Arc<Mutex<HashMap<String, Arc<CommandCallback>>>> = Arc::new(Mutex::new(HashMap::new()));

        let routing_outstanding = outstanding.clone();
        tokio::spawn(async move {
            while let Some(msg) = publisher.next_update().await {
                let Some(reference_nr) = msg.reference_nr() else {
                    on_update(msg);
                    continue;
                };
                let callback = if reference_nr.starts_with(&subscriber_id) {
                    let mut guard = routing_outstanding.lock().await;
                    if is_terminal(&msg) {
                        guard.remove(reference_nr)
                    } else {
                        guard.get(reference_nr).cloned()
                    }
                } else {
                    None
                };
                match callback {
                    Some(cb) => cb(msg),
                    None => on_update(msg),
                }
            }
            debug!("combi client publish routing loop ended");
        });

        Ok(Self { commands, outstanding })
    }

    /// Sends a command and registers `on_reply` for any further asynchronous
    /// updates correlated to it, in addition to the immediate reply returned
    /// here (e.g. a `PositiveConfirmation` followed later by a `SuccessfulTerm`).
    pub async fn send(&self, request: IecMsg, on_reply: impl Fn(IecMsg) + Send + Sync + 'static) -> MtuResult<IecMsg> {
        if let Some(reference_nr) = request.reference_nr().map(str::to_string) {
            self.outstanding
                .lock()
                .await
                .insert(reference_nr, Arc::new(Box::new(on_reply)));
        }
        self.commands.send(request).await
    }

    /// Sends a command with no interest in updates beyond the immediate reply.
    pub async fn send_and_forget(&self, request: IecMsg) -> MtuResult<IecMsg> {
        self.commands.send(request).await
    }

    /// The prefix the hub assigned this connection at handshake time.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        self.commands.subscriber_id()
    }

    /// Number of commands still awaiting a terminal update.
    pub async fn outstanding_count(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}

fn is_terminal(msg: &IecMsg) -> bool {
    match msg {
        IecMsg::Confirmation(c) => matches!(
            c.result.status,
            Some(ConfirmationStatus::SuccessfulTerm)
                | Some(ConfirmationStatus::Fail)
                | Some(ConfirmationStatus::FinalRespRcvd)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use mtu_shared::framing::MtuCodec;
    use mtu_shared::model::{Confirmation, ReadDatapoint, SubscriptionInitReply};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn terminal_update_is_routed_to_the_command_callback_and_then_forgotten() {
        let command_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let command_addr = command_listener.local_addr().unwrap();
        let publish_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let publish_addr = publish_listener.local_addr().unwrap();

        let config = ClientConfig {
            hub_ip: "127.0.0.1".to_string(),
            command_port: command_addr.port(),
            publish_port: publish_addr.port(),
            requested_prefix: "APP".to_string(),
            ..ClientConfig::default()
        };

        let command_task = tokio::spawn(async move {
            let (socket, _) = command_listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, MtuCodec::new());
            framed.next().await.unwrap().unwrap();
            framed
                .send(IecMsg::SubscriptionInitReply(SubscriptionInitReply {
                    subscriber_id: "APP".to_string(),
                }))
                .await
                .unwrap();
            framed.next().await.unwrap().unwrap();
            framed
                .send(IecMsg::Confirmation(Confirmation::positive_confirmation("APP_1", 1)))
                .await
                .unwrap();
        });

        let publish_task = tokio::spawn(async move {
            let (socket, _) = publish_listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, MtuCodec::new());
            framed
                .send(IecMsg::Confirmation(Confirmation::successful_term("APP_1", 1)))
                .await
                .unwrap();
        });

        let general_updates = Arc::new(AtomicUsize::new(0));
        let general_updates_clone = general_updates.clone();
        let client = CombiClient::connect(&config, 2, 3, move |_msg| {
            general_updates_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        let routed = Arc::new(AtomicUsize::new(0));
        let routed_clone = routed.clone();
        let reply = client
            .send(
                IecMsg::ReadDatapoint(ReadDatapoint {
                    coa: 1,
                    ioa: 2,
                    reference_nr: "APP_1".to_string(),
                    max_tries: 1,
                    queue_on_collision: false,
                }),
                move |_msg| {
                    routed_clone.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.reference_nr(), Some("APP_1"));
        assert_eq!(client.outstanding_count().await, 1);

        command_task.await.unwrap();
        publish_task.await.unwrap();

        for _ in 0..50 {
            if routed.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(routed.load(Ordering::SeqCst), 1);
        assert_eq!(general_updates.load(Ordering::SeqCst), 0);
        assert_eq!(client.outstanding_count().await, 0);
    }
}
