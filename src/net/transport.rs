// Peer transport: one send task and one receive task per connected peer,
// a bounded outbound queue between the rest of the node and the send task,
// and a listening `Server` that accepts inbound connections with a
// per-address connection-rate limit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::TcpKeepalive;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;

use crate::config::TransportConfig;
use crate::net::protocol::{self, Message};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("peer connection is closed")]
    PeerClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to a single live peer connection. Cloneable; every clone shares the
/// same outbound queue, close flag, and per-peer cancellation token.
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    sender: mpsc::Sender<Message>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    cancel: tokio_util::sync::CancellationToken,
}

impl PeerHandle {
    pub async fn send(&self, message: Message, deadline: Duration) -> Result<(), TransportError> {
        if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(TransportError::PeerClosed);
        }
        match timeout(deadline, self.sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::PeerClosed),
            Err(_) => Err(TransportError::QueueFull),
        }
    }

    /// Idempotent. Sets the close flag, signals both the send and receive
    /// tasks via the peer's cancellation token (which drains the outbound
    /// queue and lets the writer tear the connection down within its own
    /// 5-second deadline), and returns without waiting on them.
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Relaxed)
    }
}

fn apply_socket_opts(stream: &TcpStream, cfg: &TransportConfig) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(cfg.keepalive_interval);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Spawn the send/receive task pair for one connection. `on_message` is
/// invoked (from the receive task) for every fully-decoded, non-fragment
/// message; it should not block for long.
pub fn spawn_peer<F>(
    stream: TcpStream,
    addr: SocketAddr,
    cfg: Arc<TransportConfig>,
    cancel: tokio_util::sync::CancellationToken,
    on_message: F,
) -> PeerHandle
where
    F: Fn(SocketAddr, Message) + Send + Sync + 'static,
{
    let _ = apply_socket_opts(&stream, &cfg);
    let (tx, rx) = mpsc::channel(cfg.outbound_queue_capacity);
    let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    // A child of the process-wide token: cancelling `cancel` (global shutdown)
    // cascades here, and cancelling `peer_cancel` alone (a single `close()`)
    // stops only this peer's tasks.
    let peer_cancel = cancel.child_token();
    let (read_half, write_half) = stream.into_split();

    let handle = PeerHandle {
        addr,
        sender: tx,
        closed: closed.clone(),
        cancel: peer_cancel.clone(),
    };

    tokio::spawn(writer_task(write_half, rx, cfg.clone(), closed.clone(), peer_cancel.clone()));
    tokio::spawn(reader_task(read_half, addr, cfg, closed, peer_cancel, on_message));

    handle
}

async fn writer_task(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    cfg: Arc<TransportConfig>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_message = rx.recv() => {
                let Some(message) = maybe_message else { break };
                let Ok(frame) = protocol::encode(&message) else { continue };
                match timeout(cfg.send_deadline, write_half.write_all(&frame)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
    closed.store(true, std::sync::atomic::Ordering::Relaxed);
    rx.close();
    while rx.try_recv().is_ok() {} // drain so any producer still blocked on enqueue unblocks now, not at its timeout
    let _ = timeout(cfg.close_deadline, write_half.shutdown()).await;
}

async fn reader_task<F>(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    addr: SocketAddr,
    cfg: Arc<TransportConfig>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    cancel: tokio_util::sync::CancellationToken,
    on_message: F,
) where
    F: Fn(SocketAddr, Message) + Send + Sync + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(cfg.idle_deadline, read_frame(&mut read_half)) => result,
        };
        match frame {
            Ok(Ok(Some(message))) => on_message(addr, message),
            Ok(Ok(None)) => break, // clean EOF
            Ok(Err(_)) => break,
            Err(_) => break, // idle deadline elapsed
        }
    }
    closed.store(true, std::sync::atomic::Ordering::Relaxed);
    cancel.cancel(); // make sure the writer half tears down too, e.g. on our own read error
}

async fn read_frame(read_half: &mut tokio::net::tcp::OwnedReadHalf) -> std::io::Result<Option<Message>> {
    let mut header = [0u8; 10];
    if let Err(e) = read_half.read_exact(&mut header).await {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e)
        };
    }

    let payload_length = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
    if payload_length > crate::config::MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "oversize frame"));
    }

    let mut sig_len_buf = [0u8; 2];
    read_half.read_exact(&mut sig_len_buf).await?;
    let sig_len = u16::from_be_bytes(sig_len_buf) as usize;
    let mut signature = vec![0u8; sig_len];
    read_half.read_exact(&mut signature).await?;

    let mut node_len_buf = [0u8; 2];
    read_half.read_exact(&mut node_len_buf).await?;
    let node_len = u16::from_be_bytes(node_len_buf) as usize;
    let mut node_id_bytes = vec![0u8; node_len];
    read_half.read_exact(&mut node_id_bytes).await?;

    let mut payload = vec![0u8; payload_length];
    read_half.read_exact(&mut payload).await?;

    let mut frame = Vec::with_capacity(10 + sig_len + node_len + payload_length);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&sig_len_buf);
    frame.extend_from_slice(&signature);
    frame.extend_from_slice(&node_len_buf);
    frame.extend_from_slice(&node_id_bytes);
    frame.extend_from_slice(&payload);

    protocol::decode(&frame)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Live peer connections plus the accept loop and per-address rate limiter.
pub struct Server {
    cfg: Arc<TransportConfig>,
    peers: RwLock<HashMap<SocketAddr, PeerHandle>>,
    last_connect: Mutex<HashMap<SocketAddr, Instant>>,
}

impl Server {
    pub fn new(cfg: TransportConfig) -> Arc<Self> {
        Arc::new(Server {
            cfg: Arc::new(cfg),
            peers: RwLock::new(HashMap::new()),
            last_connect: Mutex::new(HashMap::new()),
        })
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().await.keys().copied().collect()
    }

    async fn rate_limited(&self, addr: SocketAddr) -> bool {
        let mut last = self.last_connect.lock().await;
        let now = Instant::now();
        if let Some(prev) = last.get(&addr) {
            if now.duration_since(*prev) < self.cfg.connect_rate_limit {
                return true;
            }
        }
        last.insert(addr, now);
        false
    }

    /// Accept connections until `cancel` fires, admitting at most
    /// `max_peers` concurrently and rejecting a second connection from the
    /// same address within `connect_rate_limit`.
    pub async fn listen<F>(
        self: Arc<Self>,
        bind_addr: SocketAddr,
        cancel: tokio_util::sync::CancellationToken,
        on_message: F,
    ) -> std::io::Result<()>
    where
        F: Fn(SocketAddr, Message) + Send + Sync + Clone + 'static,
    {
        let listener = TcpListener::bind(bind_addr).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(_) => continue,
                    };
                    if self.rate_limited(addr).await {
                        continue;
                    }
                    if self.peer_count().await >= self.cfg.max_peers {
                        continue;
                    }
                    let handle = spawn_peer(stream, addr, self.cfg.clone(), cancel.clone(), on_message.clone());
                    self.peers.write().await.insert(addr, handle);
                }
            }
        }
        Ok(())
    }

    pub async fn register(&self, addr: SocketAddr, handle: PeerHandle) {
        self.peers.write().await.insert(addr, handle);
    }

    pub async fn remove(&self, addr: &SocketAddr) {
        if let Some(handle) = self.peers.write().await.remove(addr) {
            handle.close();
        }
    }

    /// Enqueue `message` to one live peer.
    pub async fn send_to(&self, addr: SocketAddr, message: Message, deadline: Duration) -> Result<(), TransportError> {
        let handle = self.peers.read().await.get(&addr).cloned().ok_or(TransportError::PeerClosed)?;
        handle.send(message, deadline).await
    }

    /// Enqueue `message` to every live peer. A single peer's queue being
    /// full or closed never blocks or fails delivery to the others.
    pub async fn broadcast(&self, message: Message) {
        let peers: Vec<PeerHandle> = self.peers.read().await.values().cloned().collect();
        let deadline = self.cfg.send_deadline;
        for peer in peers {
            let message = message.clone();
            tokio::spawn(async move {
                let _ = peer.send(message, deadline).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::MessageType;

    #[test]
    fn test_peer_handle_close_is_idempotent() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = PeerHandle {
            addr: "127.0.0.1:9000".parse().unwrap(),
            sender: tx,
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = PeerHandle {
            addr: "127.0.0.1:9000".parse().unwrap(),
            sender: tx,
            closed: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        let message = Message::new(MessageType::Ping, Vec::new());
        let result = handle.send(message, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::PeerClosed)));
    }

    #[tokio::test]
    async fn test_server_tracks_registered_peers() {
        let server = Server::new(TransportConfig::default());
        let (tx, _rx) = mpsc::channel(1);
        let handle = PeerHandle {
            addr: "127.0.0.1:9001".parse().unwrap(),
            sender: tx,
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        server.register(handle.addr, handle).await;
        assert_eq!(server.peer_count().await, 1);
    }
}
