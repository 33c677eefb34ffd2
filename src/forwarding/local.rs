//! Local port forwarding
//!
//! Listens on a local address and bridges every accepted connection
//! through the session transport to a remote host:port over its own
//! direct-tcpip channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectFailure, Error};
use crate::events::CancelToken;
use crate::ssh::HandleController;

/// Idle timeout for a bridged connection (5 minutes).
const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Local port forwarding configuration.
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind, e.g. "127.0.0.1:8888"
    pub local_addr: String,
    /// Remote host to reach through the transport
    pub remote_host: String,
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        local_addr: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Forward a loopback port, the common case.
    pub fn loopback(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self::new(
            format!("127.0.0.1:{}", local_port),
            remote_host,
            remote_port,
        )
    }
}

/// Statistics for a running forward.
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Bytes local -> remote
    pub bytes_sent: u64,
    /// Bytes remote -> local
    pub bytes_received: u64,
}

/// Handle to a running local port forward.
pub struct LocalForwardHandle {
    pub config: LocalForward,
    /// Actual bound address (differs from the request when port 0 was asked)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    cancel: CancelToken,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
}

impl LocalForwardHandle {
    /// Stop accepting and tear down active bridges. Best effort, never
    /// errors.
    pub async fn stop(&self) {
        info!("Stopping local port forward on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let _ = self.stop_tx.send(()).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_port(&self) -> u16 {
        self.bound_addr.port()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Bind the local listener and spawn the accept loop.
///
/// Binding happens before anything else, so a bad local port rejects the
/// whole forward without touching the transport. The loop exits on stop,
/// or when the transport's close notification fires.
pub async fn start_local_forward(
    controller: HandleController,
    config: LocalForward,
) -> Result<LocalForwardHandle, Error> {
    let mut disconnect_rx = controller.subscribe_disconnect();

    let listener = TcpListener::bind(&config.local_addr)
        .await
        .map_err(|e| bind_error(&config.local_addr, e))?;
    let bound_addr = listener.local_addr().map_err(Error::Io)?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
    let cancel = CancelToken::new();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let running_task = running.clone();
    let stats_task = stats.clone();
    let cancel_task = cancel.clone();
    let remote_host = config.remote_host.clone();
    let remote_port = config.remote_port;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("Local port forward stopped: transport closed");
                    break;
                }
                _ = stop_rx.recv() => {
                    debug!("Local port forward stopped by request");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_task.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("Accepted connection from {} for forward", peer_addr);

                            {
                                let mut s = stats_task.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let controller = controller.clone();
                            let remote_host = remote_host.clone();
                            let stats = stats_task.clone();
                            let cancel = cancel_task.clone();
                            tokio::spawn(async move {
                                let result = bridge_connection(
                                    controller,
                                    stream,
                                    &remote_host,
                                    remote_port,
                                    stats.clone(),
                                    cancel,
                                )
                                .await;

                                {
                                    let mut s = stats.write();
                                    s.active_connections = s.active_connections.saturating_sub(1);
                                }

                                if let Err(e) = result {
                                    warn!("Forward connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error on forward listener: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        running_task.store(false, Ordering::SeqCst);
        debug!("Local port forward task exited");
    });

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        running,
        stop_tx,
        cancel,
        stats,
    })
}

fn bind_error(addr: &str, e: std::io::Error) -> Error {
    let message = match e.kind() {
        std::io::ErrorKind::AddrInUse => {
            format!("port already in use: {}", addr)
        }
        std::io::ErrorKind::PermissionDenied => {
            format!(
                "permission denied binding {} (ports below 1024 need elevated privileges)",
                addr
            )
        }
        std::io::ErrorKind::AddrNotAvailable => {
            format!("address not available: {}", addr)
        }
        _ => format!("failed to bind {}: {}", addr, e),
    };
    Error::Connection {
        kind: ConnectFailure::Io,
        message,
    }
}

/// Bridge one accepted local connection over a direct-tcpip channel.
///
/// The channel becomes a duplex byte stream and each direction runs on its
/// own half, so a quiet remote never stalls uploads. Dropping the halves
/// tears the channel down.
async fn bridge_connection(
    controller: HandleController,
    mut local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    cancel: CancelToken,
) -> Result<(), Error> {
    let channel = controller
        .open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
        .await?;

    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    let (mut local_read, mut local_write) = local_stream.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(channel.into_stream());
    let stats_for_send = stats.clone();
    let stats_for_recv = stats.clone();

    let local_to_remote = async {
        let mut buf = vec![0u8; 32768];
        loop {
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, local_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Err(e) = remote_write.write_all(&buf[..n]).await {
                        debug!("Channel write error: {}", e);
                        break;
                    }
                    stats_for_send.write().bytes_sent += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Local read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("Forward connection idle, closing");
                    break;
                }
            }
        }
        // Half-close so the remote end sees EOF.
        let _ = remote_write.shutdown().await;
    };

    let remote_to_local = async {
        let mut buf = vec![0u8; 32768];
        loop {
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, remote_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Err(e) = local_write.write_all(&buf[..n]).await {
                        debug!("Local write error: {}", e);
                        break;
                    }
                    stats_for_recv.write().bytes_received += n as u64;
                }
                Ok(Err(e)) => {
                    debug!("Channel read error: {}", e);
                    break;
                }
                Err(_) => {
                    debug!("Forward connection idle, closing");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = local_to_remote => {}
        _ = remote_to_local => {}
        _ = cancel.cancelled() => {
            debug!("Forward bridge cancelled");
        }
    }

    debug!("Forward connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::HandleCommand;

    fn test_controller() -> (HandleController, mpsc::Receiver<HandleCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        (HandleController::new(cmd_tx), cmd_rx)
    }

    #[test]
    fn test_loopback_constructor() {
        let forward = LocalForward::loopback(8888, "localhost", 80);
        assert_eq!(forward.local_addr, "127.0.0.1:8888");
        assert_eq!(forward.remote_host, "localhost");
        assert_eq!(forward.remote_port, 80);
    }

    #[test]
    fn test_bind_error_classification() {
        let e = bind_error(
            "127.0.0.1:80",
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        );
        assert!(e.to_string().contains("already in use"));

        let e = bind_error(
            "127.0.0.1:80",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(e.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_forward_binds_and_stops() {
        let (controller, _cmd_rx) = test_controller();
        let handle = start_local_forward(
            controller,
            LocalForward::loopback(0, "localhost", 9999),
        )
        .await
        .unwrap();

        assert!(handle.is_running());
        assert_ne!(handle.local_port(), 0);
        assert_eq!(handle.stats().connection_count, 0);

        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_duplicate_bind_is_rejected() {
        let (controller, _cmd_rx) = test_controller();
        let first = start_local_forward(
            controller.clone(),
            LocalForward::loopback(0, "localhost", 9999),
        )
        .await
        .unwrap();

        let taken = first.local_port();
        let result = start_local_forward(
            controller,
            LocalForward::loopback(taken, "localhost", 9999),
        )
        .await;

        match result {
            Err(Error::Connection { message, .. }) => {
                assert!(message.contains("already in use"), "got: {}", message);
            }
            other => panic!("expected bind rejection, got {:?}", other.map(|h| h.bound_addr)),
        }
    }
}
