//! TFTP File Transfer Logic
//!
//! A [`TransferSession`] owns one read or one write transfer with a single
//! peer. It is a plain state machine: every event (a packet from the peer,
//! the ack deadline, the overall deadline) goes in, an [`Action`] comes out.
//! [`run_transfer`] drives a session over its dedicated UDP endpoint.
//!
//! ```text
//! Requesting ──RRQ──▶ Sending ───┐
//!      │                         ├──▶ Completed | Aborted
//!      └──────WRQ──▶ Receiving ──┘
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

use crate::error::TransferError;
use crate::file_io::{ChunkSink, ChunkSource};
use crate::protocol::{BLOCK_SIZE, Direction, Packet, TftpRequest, TransferMode};
use crate::resolver::{FileResolver, confine_new, sanitize_filename};

const ACK_TIMEOUT_MILLIS: u64 = 500;
const CONN_TIMEOUT_MILLIS: u64 = 3000;

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub root_dir: PathBuf,
    /// Deadline for the peer to answer the last packet we sent
    pub ack_timeout: Duration,
    /// Hard ceiling on the whole transfer
    pub conn_timeout: Duration,
    pub local_bind: Option<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MILLIS),
            conn_timeout: Duration::from_millis(CONN_TIMEOUT_MILLIS),
            local_bind: None,
        }
    }
}

impl TransferConfig {
    /// How many times the current packet may be retransmitted
    ///
    /// `floor(conn_timeout / ack_timeout)`
    pub fn retry_budget(&self) -> u32 {
        let ack = self.ack_timeout.as_micros();
        if ack == 0 {
            return 0;
        }
        u32::try_from(self.conn_timeout.as_micros() / ack).unwrap_or(u32::MAX)
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, request not yet handled
    Requesting,
    /// Serving an RRQ
    Sending,
    /// Serving a WRQ
    Receiving,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// What the driver must do after feeding an event to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transmit the packet and (re)arm the ack deadline
    Send(Packet),
    /// Transmit the packet, leave the ack deadline alone
    Reply(Packet),
    /// Nothing to do
    Wait,
    /// The session is over; transmit the packet if there is one
    Finish(Option<Packet>),
}

/// Record of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub peer: SocketAddr,
    pub direction: Direction,
    pub path: PathBuf,
    /// Bytes carried in DATA payloads
    pub bytes: u64,
    pub blocks: u64,
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} with {}: {} bytes in {} blocks",
            self.direction,
            self.path.display(),
            self.peer,
            self.bytes,
            self.blocks
        )
    }
}

#[derive(Debug)]
enum FileHandle {
    None,
    Source(ChunkSource),
    Sink(ChunkSink),
}

/// One read or write transfer with one peer
#[derive(Debug)]
pub struct TransferSession {
    peer: SocketAddr,
    direction: Option<Direction>,
    mode: TransferMode,
    state: SessionState,
    /// Sending: block of the DATA awaiting its ACK.
    /// Receiving: last block written and acknowledged.
    block: u16,
    retries: u32,
    retry_budget: u32,
    file: FileHandle,
    path: Option<PathBuf>,
    last_sent: Option<Packet>,
    last_chunk_len: usize,
    bytes: u64,
    blocks: u64,
    abort_reason: Option<TransferError>,
}

impl TransferSession {
    pub fn new(peer: SocketAddr, config: &TransferConfig) -> Self {
        Self {
            peer,
            direction: None,
            mode: TransferMode::Octet,
            state: SessionState::Requesting,
            block: 0,
            retries: 0,
            retry_budget: config.retry_budget(),
            file: FileHandle::None,
            path: None,
            last_sent: None,
            last_chunk_len: 0,
            bytes: 0,
            blocks: 0,
            abort_reason: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    /// Current block, see the field docs for its meaning per direction
    pub fn block(&self) -> u16 {
        self.block
    }

    /// Retransmissions of the current packet so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn abort_reason(&self) -> Option<&TransferError> {
        self.abort_reason.as_ref()
    }

    /// Handle the request that created this session
    pub fn start(&mut self, request: TftpRequest, root: &Path, resolver: &dyn FileResolver) -> Action {
        if self.state != SessionState::Requesting {
            return Action::Wait;
        }

        self.direction = Some(request.direction);
        self.mode = request.mode;

        let Some(filename) = sanitize_filename(&request.filename) else {
            tracing::warn!("Rejecting unusable filename '{}' from {}", request.filename, self.peer);
            return self.abort(TransferError::AccessViolation);
        };

        match request.direction {
            Direction::Read => self.start_read(root, &filename, resolver),
            Direction::Write => self.start_write(root, &filename),
        }
    }

    fn start_read(&mut self, root: &Path, filename: &Path, resolver: &dyn FileResolver) -> Action {
        let source = match ChunkSource::open_resolved(resolver, root, filename, self.mode) {
            Ok(source) => source,
            Err(e) => {
                tracing::debug!("Cannot open {} for {}: {}", filename.display(), self.peer, e);
                return self.abort(TransferError::from_read_open(e));
            }
        };

        tracing::info!("Transferring {} to {}", source.path().display(), self.peer);
        self.path = Some(source.path().to_path_buf());
        self.file = FileHandle::Source(source);
        self.state = SessionState::Sending;
        self.send_next_block()
    }

    fn start_write(&mut self, root: &Path, filename: &Path) -> Action {
        let requested = root.join(filename);
        let path = match confine_new(root, &requested) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Refusing to write {} for {}: {}", requested.display(), self.peer, e);
                return self.abort(TransferError::AccessViolation);
            }
        };

        let sink = match ChunkSink::create(&path, self.mode) {
            Ok(sink) => sink,
            Err(e) => {
                tracing::debug!("Cannot create {} for {}: {}", path.display(), self.peer, e);
                return self.abort(TransferError::from_write_open(e));
            }
        };

        tracing::info!("Receiving {} from {}", path.display(), self.peer);
        self.path = Some(path);
        self.file = FileHandle::Sink(sink);
        self.state = SessionState::Receiving;
        self.block = 0;
        self.transmit(Packet::Ack { block: 0 })
    }

    /// Decode and handle a datagram from the peer; undecodable ones are ignored
    pub fn on_datagram(&mut self, datagram: &[u8]) -> Action {
        match Packet::decode(datagram) {
            Ok(packet) => self.on_packet(packet),
            Err(e) => {
                tracing::debug!("Ignoring datagram from {}: {}", self.peer, e);
                Action::Wait
            }
        }
    }

    pub fn on_packet(&mut self, packet: Packet) -> Action {
        match (self.state, packet) {
            (state, _) if state.is_terminal() => Action::Wait,
            (_, Packet::Error { code, message }) => {
                tracing::debug!("{} cancelled the transfer: {} {}", self.peer, code, message);
                self.abort(TransferError::PeerError { code, message })
            }
            (SessionState::Sending, Packet::Ack { block }) => self.on_ack(block),
            (SessionState::Receiving, Packet::Data { block, payload }) => self.on_data(block, &payload),
            (_, packet) => {
                tracing::debug!("Ignoring unexpected {} from {}", packet, self.peer);
                Action::Wait
            }
        }
    }

    fn on_ack(&mut self, block: u16) -> Action {
        if block != self.block {
            tracing::debug!("Ignoring stale ACK #{} from {} (expecting #{})", block, self.peer, self.block);
            return Action::Wait;
        }

        self.retries = 0;
        if self.last_chunk_len < BLOCK_SIZE {
            return self.complete(None);
        }
        self.send_next_block()
    }

    fn on_data(&mut self, block: u16, payload: &[u8]) -> Action {
        if block != self.block.wrapping_add(1) {
            tracing::debug!("Duplicate DATA #{} from {}, re-acknowledging #{}", block, self.peer, self.block);
            return Action::Reply(Packet::Ack { block: self.block });
        }

        let FileHandle::Sink(sink) = &mut self.file else {
            return Action::Wait;
        };
        if let Err(e) = sink.write_chunk(payload) {
            return self.abort(TransferError::Io(e));
        }

        self.block = block;
        self.retries = 0;
        self.bytes += payload.len() as u64;
        self.blocks += 1;

        let ack = Packet::Ack { block };
        if payload.len() < BLOCK_SIZE {
            self.last_sent = Some(ack.clone());
            return self.complete(Some(ack));
        }
        self.transmit(ack)
    }

    /// The ack deadline expired
    pub fn on_ack_timeout(&mut self) -> Action {
        if !matches!(self.state, SessionState::Sending | SessionState::Receiving) {
            return Action::Wait;
        }

        if self.retries >= self.retry_budget {
            return self.abort(TransferError::AckTimeoutExceeded { retries: self.retries });
        }

        let Some(packet) = self.last_sent.clone() else {
            return Action::Wait;
        };
        self.retries += 1;
        tracing::debug!("Retransmitting {} to {} (retry {})", packet, self.peer, self.retries);
        Action::Send(packet)
    }

    /// The overall deadline expired
    pub fn on_conn_timeout(&mut self) -> Action {
        if self.is_terminated() {
            return Action::Wait;
        }
        self.abort(TransferError::ConnTimeoutExceeded)
    }

    /// Abort without notifying the peer, e.g. after the endpoint failed
    pub fn fail(&mut self, err: TransferError) {
        if !self.is_terminated() {
            self.release();
            self.state = SessionState::Aborted;
            self.abort_reason = Some(err);
        }
    }

    /// Consume a terminated session into its outcome
    pub fn into_result(mut self) -> Result<TransferSummary, TransferError> {
        match self.state {
            SessionState::Completed => Ok(TransferSummary {
                peer: self.peer,
                direction: self.direction.unwrap_or(Direction::Read),
                path: self.path.take().unwrap_or_default(),
                bytes: self.bytes,
                blocks: self.blocks,
            }),
            _ => Err(self.abort_reason.take().unwrap_or(TransferError::ConnTimeoutExceeded)),
        }
    }

    fn send_next_block(&mut self) -> Action {
        let FileHandle::Source(source) = &mut self.file else {
            return Action::Wait;
        };

        let chunk = match source.read_chunk(BLOCK_SIZE) {
            Ok(chunk) => chunk,
            Err(e) => return self.abort(TransferError::Io(e)),
        };

        self.block = self.block.wrapping_add(1);
        self.last_chunk_len = chunk.len();
        self.bytes += chunk.len() as u64;
        self.blocks += 1;
        self.transmit(Packet::Data {
            block: self.block,
            payload: chunk,
        })
    }

    fn transmit(&mut self, packet: Packet) -> Action {
        self.last_sent = Some(packet.clone());
        Action::Send(packet)
    }

    fn complete(&mut self, last: Option<Packet>) -> Action {
        if let FileHandle::Sink(sink) = std::mem::replace(&mut self.file, FileHandle::None)
            && let Err(e) = sink.close()
        {
            return self.abort(TransferError::Io(e));
        }

        self.release();
        self.state = SessionState::Completed;
        Action::Finish(last)
    }

    fn abort(&mut self, err: TransferError) -> Action {
        let packet = err.error_packet();
        self.fail(err);
        Action::Finish(packet)
    }

    /// Close the file handle, whatever state the transfer is in
    fn release(&mut self) {
        match std::mem::replace(&mut self.file, FileHandle::None) {
            FileHandle::Sink(sink) => {
                let path = sink.path().to_path_buf();
                if let Err(e) = sink.close() {
                    tracing::warn!("Failed to close {}: {}", path.display(), e);
                }
            }
            FileHandle::Source(source) => drop(source),
            FileHandle::None => {}
        }
    }
}

/// Create an ephemeral UDP socket appropriate for the client address family
pub async fn create_ephemeral_socket(client: SocketAddr, local_bind: Option<IpAddr>) -> Result<UdpSocket> {
    let bind_addr = match (local_bind, client) {
        (Some(ip), _) => SocketAddr::new(ip, 0),
        (None, SocketAddr::V4(_)) => SocketAddr::from(([0, 0, 0, 0], 0)),
        (None, SocketAddr::V6(_)) => SocketAddr::from(([0u16; 8], 0)),
    };

    let sock = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind ephemeral socket")?;

    tracing::debug!("Transfer socket bound to {}", sock.local_addr()?);
    Ok(sock)
}

/// Drive `session` to completion over its dedicated endpoint.
///
/// `first` is the action returned by [`TransferSession::start`]. Datagrams
/// the peer keeps sending to the server's main socket arrive on `inbox`;
/// datagrams reaching `socket` from any other address are ignored.
pub async fn run_transfer(
    socket: UdpSocket,
    mut session: TransferSession,
    first: Action,
    mut inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    config: &TransferConfig,
) -> Result<TransferSummary, TransferError> {
    let peer = session.peer();
    let conn_deadline = Instant::now() + config.conn_timeout;
    let mut ack_deadline: Option<Instant> = None;
    let mut buf = vec![0u8; 1500]; // MTU size buffer
    let mut action = first;

    loop {
        let outgoing = match action {
            Action::Send(packet) => {
                ack_deadline = Some(Instant::now() + config.ack_timeout);
                Some(packet)
            }
            Action::Reply(packet) => Some(packet),
            Action::Wait => None,
            Action::Finish(packet) => {
                if let Some(packet) = packet
                    && let Err(e) = socket.send_to(&packet.encode(), peer).await
                {
                    tracing::debug!("Failed to send final {} to {}: {}", packet, peer, e);
                }
                break;
            }
        };

        if let Some(packet) = outgoing
            && let Err(e) = socket.send_to(&packet.encode(), peer).await
        {
            session.fail(TransferError::Io(e));
            break;
        }

        action = tokio::select! {
            biased;
            _ = sleep_until(conn_deadline) => session.on_conn_timeout(),
            _ = sleep_until(ack_deadline.unwrap_or(conn_deadline)), if ack_deadline.is_some() => {
                session.on_ack_timeout()
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) if src == peer => session.on_datagram(&buf[..len]),
                Ok((_, src)) => {
                    tracing::debug!("Ignoring datagram from unknown transfer ID {}", src);
                    Action::Wait
                }
                Err(e) => {
                    tracing::debug!("Receive error on transfer socket for {}: {}", peer, e);
                    Action::Wait
                }
            },
            Some(datagram) = inbox.recv() => session.on_datagram(&datagram),
        };
    }

    session.into_result()
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::protocol::TftpErrorCode;
    use crate::resolver::{FlatResolver, OberonResolver};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn config(root: &Path, ack_millis: u64, conn_millis: u64) -> TransferConfig {
        TransferConfig {
            root_dir: root.to_path_buf(),
            ack_timeout: Duration::from_millis(ack_millis),
            conn_timeout: Duration::from_millis(conn_millis),
            local_bind: None,
        }
    }

    fn read_session(content: &[u8]) -> (TempDir, TransferSession, Action) {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), content).unwrap();
        let config = config(temp_dir.path(), 500, 3000);

        let mut session = TransferSession::new(peer(), &config);
        let request = TftpRequest::read_request("a.txt", TransferMode::Octet);
        let first = session.start(request, temp_dir.path(), &FlatResolver);
        (temp_dir, session, first)
    }

    fn write_session(filename: &str) -> (TempDir, TransferSession, Action) {
        let temp_dir = tempdir().unwrap();
        let config = config(temp_dir.path(), 500, 3000);

        let mut session = TransferSession::new(peer(), &config);
        let request = TftpRequest::write_request(filename, TransferMode::Octet);
        let first = session.start(request, temp_dir.path(), &FlatResolver);
        (temp_dir, session, first)
    }

    fn data_block(action: &Action) -> Option<(u16, usize)> {
        match action {
            Action::Send(Packet::Data { block, payload }) => Some((*block, payload.len())),
            _ => None,
        }
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.conn_timeout, Duration::from_secs(3));
        assert_eq!(config.root_dir, PathBuf::from("."));
        assert_eq!(config.retry_budget(), 6);
    }

    #[test]
    fn test_retry_budget_floors() {
        let temp_dir = tempdir().unwrap();
        assert_eq!(config(temp_dir.path(), 100, 300).retry_budget(), 3);
        assert_eq!(config(temp_dir.path(), 400, 1000).retry_budget(), 2);
        assert_eq!(config(temp_dir.path(), 0, 1000).retry_budget(), 0);
    }

    #[test]
    fn test_simple_read() {
        let (_guard, mut session, first) = read_session(b"0123456789");

        assert_eq!(
            first,
            Action::Send(Packet::Data {
                block: 1,
                payload: b"0123456789".to_vec(),
            })
        );
        assert_eq!(session.state(), SessionState::Sending);

        assert_eq!(session.on_packet(Packet::Ack { block: 1 }), Action::Finish(None));
        assert_eq!(session.state(), SessionState::Completed);

        let summary = session.into_result().unwrap();
        assert_eq!(summary.bytes, 10);
        assert_eq!(summary.blocks, 1);
        assert_eq!(summary.direction, Direction::Read);
    }

    #[test]
    fn test_block_count() {
        for (size, expected) in [(0usize, 1u64), (511, 1), (512, 2), (1000, 2), (1024, 3), (1536, 4)] {
            let content = vec![b'x'; size];
            let (_guard, mut session, mut action) = read_session(&content);

            let mut sizes = Vec::new();
            while let Some((block, len)) = data_block(&action) {
                sizes.push(len);
                action = session.on_packet(Packet::Ack { block });
            }

            assert_eq!(action, Action::Finish(None), "size {}", size);
            assert_eq!(sizes.len() as u64, expected, "size {}", size);
            assert!(*sizes.last().unwrap() < BLOCK_SIZE);
            assert_eq!(sizes.iter().sum::<usize>(), size);
        }
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let (_guard, mut session, first) = read_session(&[1u8; 1500]);
        assert_eq!(data_block(&first), Some((1, 512)));

        let second = session.on_packet(Packet::Ack { block: 1 });
        assert_eq!(data_block(&second), Some((2, 512)));

        assert_eq!(session.on_packet(Packet::Ack { block: 1 }), Action::Wait);
        assert_eq!(session.on_packet(Packet::Ack { block: 0 }), Action::Wait);
        assert_eq!(session.block(), 2);
        assert_eq!(session.state(), SessionState::Sending);
    }

    #[test]
    fn test_read_retransmits_then_gives_up() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"hello").unwrap();
        let config = config(temp_dir.path(), 100, 300);

        let mut session = TransferSession::new(peer(), &config);
        let first = session.start(
            TftpRequest::read_request("a.txt", TransferMode::Octet),
            temp_dir.path(),
            &FlatResolver,
        );

        for retry in 1..=3 {
            assert_eq!(session.on_ack_timeout(), first, "retry {}", retry);
            assert_eq!(session.retries(), retry);
        }
        assert_eq!(session.on_ack_timeout(), Action::Finish(None));
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(matches!(
            session.into_result(),
            Err(TransferError::AckTimeoutExceeded { retries: 3 })
        ));
    }

    #[test]
    fn test_ack_resets_retry_count() {
        let (_guard, mut session, _) = read_session(&[0u8; 600]);
        session.on_ack_timeout();
        session.on_ack_timeout();
        assert_eq!(session.retries(), 2);

        session.on_packet(Packet::Ack { block: 1 });
        assert_eq!(session.retries(), 0);
    }

    #[test]
    fn test_conn_timeout_aborts_silently() {
        let (_guard, mut session, _) = read_session(&[0u8; 2000]);
        session.on_packet(Packet::Ack { block: 1 });

        assert_eq!(session.on_conn_timeout(), Action::Finish(None));
        assert!(session.is_terminated());
        assert!(matches!(session.into_result(), Err(TransferError::ConnTimeoutExceeded)));
    }

    #[test]
    fn test_read_missing_file() {
        let temp_dir = tempdir().unwrap();
        let config = config(temp_dir.path(), 500, 3000);
        let mut session = TransferSession::new(peer(), &config);

        let action = session.start(
            TftpRequest::read_request("missing.txt", TransferMode::Octet),
            temp_dir.path(),
            &FlatResolver,
        );

        assert_eq!(
            action,
            Action::Finish(Some(Packet::error(TftpErrorCode::FileNotFound, "File not found")))
        );
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_read_through_oberon_library() {
        let temp_dir = tempdir().unwrap();
        let oberon = temp_dir.path().join("Oberon");
        let proj = oberon.join("proj");
        std::fs::create_dir_all(&proj).unwrap();
        std::fs::create_dir_all(oberon.join("Lib")).unwrap();
        std::fs::write(oberon.join("Lib").join("Texts.Mod"), b"MODULE Texts;").unwrap();

        let config = config(&proj, 500, 3000);
        let mut session = TransferSession::new(peer(), &config);
        let action = session.start(
            TftpRequest::read_request("Texts.Mod", TransferMode::Octet),
            &proj,
            &OberonResolver,
        );

        assert_eq!(
            action,
            Action::Send(Packet::Data {
                block: 1,
                payload: b"MODULE Texts;".to_vec(),
            })
        );
    }

    #[test]
    fn test_simple_write() {
        let (temp_dir, mut session, first) = write_session("new.txt");
        assert_eq!(first, Action::Send(Packet::Ack { block: 0 }));
        assert_eq!(session.state(), SessionState::Receiving);

        let action = session.on_packet(Packet::Data {
            block: 1,
            payload: vec![b'a'; 512],
        });
        assert_eq!(action, Action::Send(Packet::Ack { block: 1 }));

        let action = session.on_packet(Packet::Data {
            block: 2,
            payload: b"tail".to_vec(),
        });
        assert_eq!(action, Action::Finish(Some(Packet::Ack { block: 2 })));
        assert_eq!(session.state(), SessionState::Completed);

        let written = std::fs::read(temp_dir.path().join("new.txt")).unwrap();
        assert_eq!(written.len(), 516);
        assert!(written.ends_with(b"tail"));
    }

    #[test]
    fn test_duplicate_data_is_not_written_twice() {
        let (temp_dir, mut session, _) = write_session("dup.bin");

        let block = Packet::Data {
            block: 1,
            payload: vec![7u8; 512],
        };
        assert_eq!(session.on_packet(block.clone()), Action::Send(Packet::Ack { block: 1 }));
        assert_eq!(session.on_packet(block), Action::Reply(Packet::Ack { block: 1 }));
        assert_eq!(session.block(), 1);

        session.on_packet(Packet::Data {
            block: 2,
            payload: Vec::new(),
        });
        assert_eq!(session.state(), SessionState::Completed);

        let written = std::fs::read(temp_dir.path().join("dup.bin")).unwrap();
        assert_eq!(written.len(), 512);
    }

    #[test]
    fn test_out_of_order_data_reacknowledges_last_block() {
        let (_guard, mut session, _) = write_session("gap.bin");

        let action = session.on_packet(Packet::Data {
            block: 3,
            payload: vec![0u8; 512],
        });
        assert_eq!(action, Action::Reply(Packet::Ack { block: 0 }));
        assert_eq!(session.state(), SessionState::Receiving);
    }

    #[test]
    fn test_write_rejects_existing_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("exists.txt");
        std::fs::write(&path, b"keep me").unwrap();
        let config = config(temp_dir.path(), 500, 3000);

        let mut session = TransferSession::new(peer(), &config);
        let action = session.start(
            TftpRequest::write_request("exists.txt", TransferMode::Octet),
            temp_dir.path(),
            &FlatResolver,
        );

        assert!(matches!(action, Action::Finish(Some(Packet::Error { code: 6, .. }))));
        assert_eq!(session.state(), SessionState::Aborted);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn test_write_into_missing_directory() {
        let (_guard, session, action) = write_session("no/such/dir/file.txt");
        assert!(matches!(action, Action::Finish(Some(Packet::Error { code: 2, .. }))));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_write_path_stays_under_root() {
        let (temp_dir, mut session, first) = write_session("../../escape.txt");
        assert_eq!(first, Action::Send(Packet::Ack { block: 0 }));

        session.on_packet(Packet::Data {
            block: 1,
            payload: b"x".to_vec(),
        });
        assert!(temp_dir.path().join("escape.txt").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_through_symlink_out_of_root() {
        let temp_dir = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), temp_dir.path().join("link")).unwrap();
        let config = config(temp_dir.path(), 500, 3000);

        let mut session = TransferSession::new(peer(), &config);
        let action = session.start(
            TftpRequest::write_request("link/evil.txt", TransferMode::Octet),
            temp_dir.path(),
            &FlatResolver,
        );

        assert!(matches!(action, Action::Finish(Some(Packet::Error { code: 2, .. }))));
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(!elsewhere.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_read_through_symlink_out_of_root() {
        let temp_dir = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        std::fs::write(elsewhere.path().join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(elsewhere.path(), temp_dir.path().join("link")).unwrap();
        let config = config(temp_dir.path(), 500, 3000);

        let mut session = TransferSession::new(peer(), &config);
        let action = session.start(
            TftpRequest::read_request("link/secret.txt", TransferMode::Octet),
            temp_dir.path(),
            &FlatResolver,
        );

        assert!(matches!(action, Action::Finish(Some(Packet::Error { code: 2, .. }))));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_unusable_filename() {
        let (_guard, session, action) = write_session("..");
        assert!(matches!(action, Action::Finish(Some(Packet::Error { code: 2, .. }))));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_write_timeout_leaves_partial_file() {
        let (temp_dir, mut session, _) = write_session("partial.bin");
        session.on_packet(Packet::Data {
            block: 1,
            payload: vec![1u8; 512],
        });

        assert_eq!(session.on_conn_timeout(), Action::Finish(None));
        assert_eq!(std::fs::read(temp_dir.path().join("partial.bin")).unwrap().len(), 512);
    }

    #[test]
    fn test_peer_error_aborts_without_reply() {
        let (_guard, mut session, _) = read_session(&[0u8; 1024]);

        let action = session.on_packet(Packet::Error {
            code: 0,
            message: "user cancelled".to_string(),
        });
        assert_eq!(action, Action::Finish(None));
        assert!(matches!(session.abort_reason(), Some(TransferError::PeerError { code: 0, .. })));
    }

    #[test]
    fn test_malformed_datagram_is_ignored() {
        let (_guard, mut session, _) = read_session(&[0u8; 1024]);
        assert_eq!(session.on_datagram(&[0, 4, 0]), Action::Wait);
        assert_eq!(session.on_datagram(&[0, 9, 0, 1]), Action::Wait);
        assert_eq!(session.state(), SessionState::Sending);
        assert_eq!(session.block(), 1);
    }

    #[test]
    fn test_events_after_termination_are_ignored() {
        let (_guard, mut session, _) = read_session(b"short");
        session.on_packet(Packet::Ack { block: 1 });

        assert_eq!(session.on_packet(Packet::Ack { block: 1 }), Action::Wait);
        assert_eq!(session.on_ack_timeout(), Action::Wait);
        assert_eq!(session.on_conn_timeout(), Action::Wait);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn test_block_number_wraps() {
        let (_guard, mut session, _) = read_session(&[0u8; 2048]);
        session.block = u16::MAX;

        let action = session.on_packet(Packet::Ack { block: u16::MAX });
        assert_eq!(data_block(&action), Some((0, 512)));
    }

    #[tokio::test]
    async fn test_run_transfer_retransmits_twice_within_deadline() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"never acknowledged").unwrap();
        let config = config(temp_dir.path(), 100, 300);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut session = TransferSession::new(client.local_addr().unwrap(), &config);
        let first = session.start(
            TftpRequest::read_request("a.txt", TransferMode::Octet),
            temp_dir.path(),
            &FlatResolver,
        );
        let (_inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let result = run_transfer(socket, session, first, inbox_rx, &config).await;
        assert!(matches!(result, Err(TransferError::ConnTimeoutExceeded)));

        let mut buf = [0u8; 1500];
        let mut sends = 0;
        while let Ok(Ok((len, _))) = tokio::time::timeout(Duration::from_millis(50), client.recv_from(&mut buf)).await {
            assert_eq!(Packet::decode(&buf[..len]).unwrap().opcode(), crate::TftpOpcode::Data);
            sends += 1;
        }
        assert_eq!(sends, 3);
    }

    #[tokio::test]
    async fn test_run_transfer_accepts_forwarded_datagrams() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"forwarded").unwrap();
        let config = config(temp_dir.path(), 500, 3000);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut session = TransferSession::new(client.local_addr().unwrap(), &config);
        let first = session.start(
            TftpRequest::read_request("a.txt", TransferMode::Octet),
            temp_dir.path(),
            &FlatResolver,
        );
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        inbox_tx.send(Packet::Ack { block: 1 }.encode()).unwrap();

        let summary = run_transfer(socket, session, first, inbox_rx, &config).await.unwrap();
        assert_eq!(summary.bytes, 9);
        assert_eq!(summary.path, temp_dir.path().join("a.txt"));
    }
}
