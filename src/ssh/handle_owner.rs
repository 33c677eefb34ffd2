//! Handle owner task
//!
//! Exactly one task owns the russh `Handle`. Everything else talks to it
//! through a cloneable [`HandleController`] that sends commands over an
//! mpsc channel and waits on oneshot replies.
//!
//! This avoids `Arc<Mutex<Handle>>` lock contention, deadlocks from holding
//! a lock across `.await`, and protocol violations from concurrent Handle
//! access. When the owner task exits it broadcasts a single disconnect
//! notification that downstream consumers (session, forwards, watchers)
//! use as the authoritative close signal.

use russh::client::{Handle, Msg};
use russh::Channel;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use crate::error::Error;

const KEEPALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a liveness probe, split by how the caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Connection is healthy
    Ok,
    /// Probe timed out; may be transient latency, safe to retry
    Timeout,
    /// Transport is gone; caller should treat the session as dead
    IoError,
}

/// Commands accepted by the owner task.
pub enum HandleCommand {
    /// Open a session channel (exec, sftp subsystem, shell readers)
    OpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel for a local port forward
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Probe transport liveness via keepalive
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Tear the connection down
    Disconnect,
}

/// Cloneable command sender for the owner task.
///
/// Any holder has full transport control (channels, forwards, disconnect),
/// so controllers stay inside the process and are never serialized.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Build a controller around an existing command channel.
    ///
    /// Used by tests that script the owner side; production code goes
    /// through [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Controller whose close notification is fired by the test itself.
    #[cfg(test)]
    pub(crate) fn new_with_notifier(
        cmd_tx: mpsc::Sender<HandleCommand>,
        disconnect_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Subscribe to the close notification.
    ///
    /// The owner task sends exactly one `()` when the transport is torn
    /// down, whatever the cause. Use in `tokio::select!` loops to stop
    /// forwards, watchers and transfers.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a session channel.
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenSession { reply_tx })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(channel_error)
    }

    /// Open a direct-tcpip channel toward `host:port`.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(channel_error)
    }

    /// Probe the transport. Never errors; degraded states map to
    /// [`PingResult::Timeout`] or [`PingResult::IoError`].
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .is_err()
        {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Ask the owner task to close the transport.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

fn channel_error(err: russh::Error) -> Error {
    match err {
        russh::Error::Disconnect => Error::Disconnected,
        other => Error::Channel(other.to_string()),
    }
}

/// Spawn the owner task, consuming the `Handle`.
///
/// `label` identifies the session in logs (typically `host:port:user`).
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_task = disconnect_tx.clone();

    tokio::spawn(async move {
        info!("Handle owner task started for {}", label);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::OpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving session channel");
                    }
                }

                Some(HandleCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct-tcpip channel");
                    }
                }

                Some(HandleCommand::Ping { reply_tx }) => {
                    // send_keepalive(true) is SSH_MSG_GLOBAL_REQUEST
                    // "keepalive@openssh.com" with want_reply, the proper
                    // heartbeat. Opening a probe channel instead would leak
                    // channels on the server.
                    debug!("Keepalive probe for {}", label);
                    let result = match tokio::time::timeout(
                        KEEPALIVE_PROBE_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(russh::Error::Disconnect)) => {
                            warn!("Keepalive found {} disconnected", label);
                            PingResult::IoError
                        }
                        Ok(Err(e)) => {
                            warn!("Keepalive error for {} (soft failure): {}", label, e);
                            PingResult::Timeout
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for {}", label);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for {}", label);
                    break;
                }

                None => {
                    info!("All controllers dropped for {}", label);
                    break;
                }
            }
        }

        // Cleanup: exactly one close notification, then fail pending
        // callers, then end the transport.
        let _ = disconnect_tx_task.send(());
        drain_pending_commands(&mut cmd_rx);
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Fail every queued command so no caller hangs on a dead transport.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_roundtrip_with_scripted_owner() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let controller = HandleController::new(cmd_tx);

        tokio::spawn(async move {
            if let Some(HandleCommand::Ping { reply_tx }) = cmd_rx.recv().await {
                let _ = reply_tx.send(PingResult::Ok);
            }
        });

        assert_eq!(controller.ping().await, PingResult::Ok);
    }

    #[tokio::test]
    async fn test_closed_owner_maps_to_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let controller = HandleController::new(cmd_tx);
        drop(cmd_rx);

        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        let err = controller.open_session_channel().await.unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[tokio::test]
    async fn test_owner_error_reply_maps_to_disconnected() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let controller = HandleController::new(cmd_tx);

        tokio::spawn(async move {
            if let Some(HandleCommand::OpenSession { reply_tx }) = cmd_rx.recv().await {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
        });

        let err = controller.open_session_channel().await.unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[tokio::test]
    async fn test_drain_fails_pending_callers() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);

        let (ping_tx, ping_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::Ping { reply_tx: ping_tx })
            .await
            .unwrap();

        let (open_tx, open_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::OpenSession { reply_tx: open_tx })
            .await
            .unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert_eq!(ping_rx.await.unwrap(), PingResult::IoError);
        assert!(matches!(
            open_rx.await.unwrap(),
            Err(russh::Error::Disconnect)
        ));
        assert!(cmd_tx.is_closed());
    }
}
