//! TFTP Server Implementation
//!
//! This module contains the dispatcher: it owns the well-known socket,
//! routes datagrams from known peers to their session and starts a new
//! session for every request from an unknown peer.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::PacketError;
use crate::protocol::{Packet, TftpErrorCode, TftpRequest};
use crate::resolver::{FileResolver, resolver_for};
use crate::transfer::{TransferConfig, TransferSession, create_ephemeral_socket, run_transfer};

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    pub transfer_config: TransferConfig,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:69".to_string(),
            root_directory: PathBuf::from("."),
            transfer_config: TransferConfig::default(),
        }
    }
}

type SessionId = u64;

struct SessionHandle {
    id: SessionId,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Active sessions keyed by peer address, at most one per peer
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SocketAddr, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    fn register(&mut self, peer: SocketAddr, handle: SessionHandle) {
        if let Some(previous) = self.sessions.insert(peer, handle) {
            previous.task.abort();
        }
    }

    /// Hand a datagram to the peer's session.
    ///
    /// Gives the datagram back when the peer has no live session.
    fn route(&mut self, peer: SocketAddr, datagram: Vec<u8>) -> Result<(), Vec<u8>> {
        let Some(handle) = self.sessions.get(&peer) else {
            return Err(datagram);
        };

        match handle.inbox.send(datagram) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(datagram)) => {
                // Finished, its deregistration is still queued
                self.sessions.remove(&peer);
                Err(datagram)
            }
        }
    }

    /// Remove `peer`'s entry if it still belongs to session `id`
    fn deregister(&mut self, peer: SocketAddr, id: SessionId) {
        if self.sessions.get(&peer).is_some_and(|handle| handle.id == id) {
            self.sessions.remove(&peer);
        }
    }

    /// Abandon every in-flight session
    fn abort_all(&mut self) {
        for (peer, handle) in self.sessions.drain() {
            tracing::debug!("Abandoning transfer with {}", peer);
            handle.task.abort();
        }
    }
}

/// Per-run dispatch state
struct Dispatcher {
    registry: SessionRegistry,
    config: Arc<TransferConfig>,
    resolver: Arc<dyn FileResolver>,
    done_tx: mpsc::UnboundedSender<(SocketAddr, SessionId)>,
    next_id: SessionId,
}

impl Dispatcher {
    async fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) {
        let datagram = match self.registry.route(peer, datagram.to_vec()) {
            Ok(()) => return,
            Err(datagram) => datagram,
        };

        match Packet::decode(&datagram) {
            Ok(packet) => {
                let opcode = packet.opcode();
                match packet.into_request() {
                    Some(request) => self.start_session(peer, request).await,
                    None => tracing::debug!("Ignoring {} from unknown peer {}", opcode, peer),
                }
            }
            Err(PacketError::UnsupportedMode(mode)) => {
                tracing::info!("Rejecting request in mode '{}' from {}", mode, peer);
                let message = format!("Transfer mode '{}' not supported", mode);
                self.reject(peer, Packet::error(TftpErrorCode::IllegalOperation, message))
                    .await;
            }
            Err(e) => tracing::debug!("Dropping datagram from {}: {}", peer, e),
        }
    }

    async fn start_session(&mut self, peer: SocketAddr, request: TftpRequest) {
        tracing::info!(
            "{} for '{}' in {} mode from {}",
            request.direction,
            request.filename,
            request.mode,
            peer
        );

        let socket = match create_ephemeral_socket(peer, self.config.local_bind).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("Cannot serve {}: {:#}", peer, e);
                return;
            }
        };

        let mut session = TransferSession::new(peer, &self.config);
        let first = session.start(request, &self.config.root_dir, self.resolver.as_ref());

        let id = self.next_id;
        self.next_id += 1;

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let config = Arc::clone(&self.config);
        let done_tx = self.done_tx.clone();
        let task = tokio::spawn(async move {
            match run_transfer(socket, session, first, inbox_rx, &config).await {
                Ok(summary) => tracing::info!("Completed {}", summary),
                Err(e) => tracing::warn!("Transfer with {} aborted: {}", peer, e),
            }
            let _ = done_tx.send((peer, id));
        });

        self.registry.register(peer, SessionHandle { id, inbox, task });
    }

    async fn reject(&self, peer: SocketAddr, packet: Packet) {
        let result = async {
            let socket = create_ephemeral_socket(peer, self.config.local_bind).await?;
            socket.send_to(&packet.encode(), peer).await?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to send {} to {}: {:#}", packet, peer, e);
        }
    }
}

/// Main TFTP server
pub struct TftpServer {
    config: TftpServerConfig,
    socket: Option<UdpSocket>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    pub fn new(config: TftpServerConfig) -> Self {
        Self { config, socket: None }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(TftpServerConfig::default())
    }

    /// Create a new TFTP server with custom bind address and root directory
    pub fn with_config(bind_address: String, root_directory: PathBuf) -> Self {
        let mut config = TftpServerConfig {
            bind_address,
            root_directory: root_directory.clone(),
            ..Default::default()
        };
        config.transfer_config.root_dir = root_directory;

        Self::new(config)
    }

    /// Get the server's configuration
    pub fn config(&self) -> &TftpServerConfig {
        &self.config
    }

    /// Bind the listening socket, returning the bound address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind TFTP server socket to {}", self.config.bind_address))?;

        let local_addr = socket.local_addr().context("Failed to get local address")?;
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            local_addr,
            self.config.root_directory.display()
        );

        self.socket = Some(socket);
        Ok(local_addr)
    }

    /// Get the local address the server is bound to (if running)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind if needed and serve forever
    pub async fn run(&mut self) -> Result<()> {
        self.serve(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then abandon in-flight transfers
    /// and close the listening socket.
    pub async fn serve(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        let socket = self.socket.take().context("Server must be bound before serving")?;

        let mut transfer_config = self.config.transfer_config.clone();
        transfer_config.root_dir = self.config.root_directory.clone();
        let resolver: Arc<dyn FileResolver> = Arc::from(resolver_for(&transfer_config.root_dir));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher {
            registry: SessionRegistry::new(),
            config: Arc::new(transfer_config),
            resolver,
            done_tx,
            next_id: 0,
        };

        let mut buffer = [0u8; 2048]; // Buffer for incoming packets
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("TFTP server shutting down");
                    break;
                }
                Some((peer, id)) = done_rx.recv() => {
                    dispatcher.registry.deregister(peer, id);
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, peer)) => {
                        tracing::debug!("Received packet from {}", peer);
                        dispatcher.handle_datagram(&buffer[..len], peer).await;
                    }
                    Err(e) => tracing::debug!("Receive error on server socket: {}", e),
                },
            }
        }

        dispatcher.registry.abort_all();
        Ok(())
    }
}
