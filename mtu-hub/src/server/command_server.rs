//! Command server: request/reply TCP socket subscriber applications use to
//! issue commands and station-wide queries.
//!
//! Each accepted connection is handled by its own task reading one frame at a
//! time (single-threaded over that socket, exactly like the original ZMQ REP
//! loop), but the actual command execution is handed off to a fixed-size
//! worker pool so one slow RTU round-trip never blocks another subscriber's
//! unrelated request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mtu_shared::framing::MtuCodec;
use mtu_shared::model::{
    Confirmation, ConfirmationResult, ConfirmationStatus, FailReason, IecMsg, SubscriptionInitReply,
    UNEXPECTED_MSG_REFERENCE_NR,
};
use mtu_shared::resilience::SubscriberPrefixRegistry;

use crate::subscription::CommandHandler;

/// One request routed through the worker pool, paired with the channel its
/// reply travels back on.
struct Job {
    request: IecMsg,
    reply_tx: oneshot::Sender<IecMsg>,
}

/// The command (request/reply) TCP front door.
#[derive(Debug, Clone)]
pub struct CommandServer {
    prefixes: Arc<SubscriberPrefixRegistry>,
    job_tx: mpsc::Sender<Job>,
    reply_timeout: Duration,
}

impl CommandServer {
    #[must_use]
    pub fn new(handler: CommandHandler, worker_pool_size: usize, reply_timeout: Duration) -> Self {
        let job_tx = spawn_worker_pool(handler, worker_pool_size.max(1));
        Self {
            prefixes: Arc::new(SubscriberPrefixRegistry::new()),
            job_tx,
            reply_timeout,
        }
    }

    /// Accepts connections until `stop` fires, serving each on its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener, stop: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "command server listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.serve_connection(socket, addr).await; });
                        }
                        Err(e) => warn!(error = %e, "command server accept failed"),
                    }
                }
                () = stop.cancelled() => {
                    info!("command server shutting down");
                    break;
                }
            }
        }
    }

    async fn serve_connection(&self, socket: TcpStream, addr: SocketAddr) {
        let mut framed = Framed::new(socket, MtuCodec::new());

        let init = match framed.next().await {
            Some(Ok(IecMsg::SubscriptionInitMsg(init))) => init,
            Some(Ok(other)) => {
                warn!(?addr, kind = ?other, "expected subscription handshake first");
                return;
            }
            Some(Err(e)) => {
                warn!(?addr, error = %e, "handshake frame decode error");
                return;
            }
            None => return,
        };

        let Some(subscriber_id) = self.prefixes.assign(&init.requested_prefix) else {
            warn!(?addr, prefix = init.requested_prefix, "rejected reserved or empty prefix");
            return;
        };

        if framed
            .send(IecMsg::SubscriptionInitReply(SubscriptionInitReply {
                subscriber_id: subscriber_id.clone(),
            }))
            .await
            .is_err()
        {
            self.prefixes.release(&subscriber_id);
            return;
        }
        debug!(?addr, subscriber_id, "command channel handshake complete");

        loop {
            match framed.next().await {
                Some(Ok(request)) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if self.job_tx.send(Job { request, reply_tx }).await.is_err() {
                        warn!(subscriber_id, "worker pool inbox closed");
                        break;
                    }
                    match tokio::time::timeout(self.reply_timeout, reply_rx).await {
                        Ok(Ok(reply)) => {
                            if framed.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(_)) => break,
                        Err(_) => {
                            // Budget exceeded: send nothing back, mirroring the
                            // original's no-response sentinel. The subscriber's
                            // own client-side timeout resolves this locally.
                            warn!(subscriber_id, "reply time budget exceeded, sending no response");
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(subscriber_id, error = %e, "frame decode error, dropping connection");
                    break;
                }
                None => break,
            }
        }

        self.prefixes.release(&subscriber_id);
        debug!(subscriber_id, "command channel disconnected");
    }
}

fn spawn_worker_pool(handler: CommandHandler, size: usize) -> mpsc::Sender<Job> {
    let (tx, rx) = mpsc::channel(1024);
    let rx = Arc::new(AsyncMutex::new(rx));
    for worker_id in 0..size {
        let rx = rx.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(job) = job else {
                    debug!(worker_id, "command worker pool shutting down");
                    break;
                };
                let reply = process_command(&handler, job.request).await;
                let _ = job.reply_tx.send(reply);
            }
        });
    }
    tx
}

async fn process_command(handler: &CommandHandler, request: IecMsg) -> IecMsg {
    match request {
        IecMsg::ProcessInfoControl(m) => handler.handle_process_info_control(m).await,
        IecMsg::ReadDatapoint(m) => handler.handle_read_datapoint(m).await,
        IecMsg::ParameterActivate(m) => handler.handle_parameter_activate(m).await,
        IecMsg::SysInfoControl(m) => handler.handle_sys_info_control(m).await,
        IecMsg::TotalInterroReq(m) => {
            let rtu_status = handler.rtu_status().await;
            let datapoints = handler.snapshot_datapoints().await;
            handler.handle_total_interro_request(m.reference_nr, rtu_status, datapoints)
        }
        IecMsg::RtuStatusReq(m) => {
            let rtu_status = handler.rtu_status().await;
            handler.handle_rtu_status_request(m.reference_nr, rtu_status)
        }
        IecMsg::MtuCacheReq(m) => handler.handle_cache_dump_request(m.reference_nr, handler.cache_dump()),
        other => unknown_message_reply(&other),
    }
}

/// Reply for anything that isn't a recognized command-channel request kind
/// (e.g. a subscriber mistakenly sending a reply-only message type back).
fn unknown_message_reply(other: &IecMsg) -> IecMsg {
    let reference_nr = other
        .reference_nr()
        .unwrap_or(UNEXPECTED_MSG_REFERENCE_NR)
        .to_string();
    IecMsg::Confirmation(Confirmation::new(
        ConfirmationResult {
            status: Some(ConfirmationStatus::Fail),
            reason: Some(FailReason::TypeUnsupported),
            ..Default::default()
        },
        reference_nr,
        0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtu_shared::cache::MessageCache;
    use mtu_shared::model::{ReadDatapoint, SubscriptionInitMsg};

    use crate::translator::InMemoryRtuLink;

    async fn connected_pair() -> (TcpStream, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        (client, listener)
    }

    #[tokio::test]
    async fn handshake_then_read_datapoint_round_trips() {
        let link = InMemoryRtuLink::new();
        link.add_rtu(14, [100]);
        let handler = CommandHandler::new(Arc::new(MessageCache::new()), Arc::new(link));
        let server = Arc::new(CommandServer::new(handler, 2, Duration::from_secs(1)));

        let (client, listener) = connected_pair().await;
        let stop = CancellationToken::new();
        let server_task = {
            let server = server.clone();
            let stop = stop.clone();
            tokio::spawn(async move { server.run(listener, stop).await })
        };

        let mut framed = Framed::new(client, MtuCodec::new());
        framed
            .send(IecMsg::SubscriptionInitMsg(SubscriptionInitMsg {
                requested_prefix: "HMI".to_string(),
            }))
            .await
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        match reply {
            IecMsg::SubscriptionInitReply(r) => assert_eq!(r.subscriber_id, "HMI"),
            _ => panic!("expected handshake reply"),
        }

        framed
            .send(IecMsg::ReadDatapoint(ReadDatapoint {
                coa: 14,
                ioa: 100,
                reference_nr: "APP_1".to_string(),
                max_tries: 3,
                queue_on_collision: false,
            }))
            .await
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        match reply {
            IecMsg::Confirmation(c) => assert_eq!(c.result.status, Some(ConfirmationStatus::WaitingForSend)),
            _ => panic!("expected confirmation"),
        }

        stop.cancel();
        server_task.abort();
    }
}
