//! Server side request dispatch.
//!
//! One thread owns the listening socket and reads every inbound datagram.
//! Transfers run concurrently, one scoped worker thread per client address:
//!
//! - a datagram from an address with a live session is forwarded, undecoded,
//!   to that session's inbox;
//! - a GET from any other address starts a new session;
//! - anything else from an unknown address is dropped.
//!
//! A session leaves the table right before its final FIN or ERR is sent, so
//! a client that starts a new request after seeing it always reaches the
//! dispatcher again.
//!
//! Workers send directly through the shared socket. Each `send_to` writes one
//! whole datagram, so concurrent sessions never interleave partial packets.

use crate::{
    connection::{SessionLink, is_timeout},
    file::utils::to_hex,
    stream::{
        error::TransferError,
        send::{INVALID_FILE_NAME, SenderConfig, serve_request},
    },
    transport::{self, DecodeError, MAX_DATAGRAM, MessageType},
};
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, Scope},
    time::Duration,
};

/// How often the listener wakes up to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_MAX_SESSIONS: usize = 16;
/// Hard ceiling on concurrent sessions regardless of configuration.
pub const MAX_SESSIONS_CAP: usize = 64;

/// Reason sent when a GET arrives while every session slot is taken.
pub const SERVER_BUSY: &str = "Server busy";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory requested file names are resolved against.
    pub root: PathBuf,
    /// Maximum number of transfers served at the same time.
    pub max_sessions: usize,
    pub sender: SenderConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_sessions: DEFAULT_MAX_SESSIONS,
            sender: SenderConfig::default(),
        }
    }
}

/// Live sessions keyed by client address.
///
/// Each entry carries the id of the session that registered it, so a worker
/// that finishes late can never unregister a newer session for the same
/// address.
#[derive(Default)]
struct SessionTable {
    entries: Mutex<HashMap<SocketAddr, SessionEntry>>,
    next_id: AtomicU64,
}

struct SessionEntry {
    id: u64,
    inbox: Sender<Vec<u8>>,
}

impl SessionTable {
    /// Adds a session for `addr` unless `limit` sessions are already live.
    fn register(&self, addr: SocketAddr, limit: usize) -> Option<(u64, Receiver<Vec<u8>>)> {
        let mut entries = self.lock();
        if entries.len() >= limit {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbox, inbox_rx) = mpsc::channel();
        entries.insert(addr, SessionEntry { id, inbox });
        Some((id, inbox_rx))
    }

    /// Hands `datagram` to the session for `addr`, if one is live.
    fn forward(&self, addr: SocketAddr, datagram: &[u8]) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get(&addr) else {
            return false;
        };
        if entry.inbox.send(datagram.to_vec()).is_ok() {
            return true;
        }
        // The worker is gone but has not unregistered yet.
        entries.remove(&addr);
        false
    }

    /// Removes the entry for `addr` if it still belongs to session `id`.
    fn release(&self, addr: SocketAddr, id: u64) {
        let mut entries = self.lock();
        if entries.get(&addr).is_some_and(|entry| entry.id == id) {
            entries.remove(&addr);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, SessionEntry>> {
        // A worker that panicked while holding the lock leaves the map usable.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Server {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    sessions: Arc<SessionTable>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> Result<Self, TransferError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            socket: Arc::new(socket),
            config,
            sessions: Arc::new(SessionTable::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Flag that makes [`Server::run`] return once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Serves requests until the shutdown flag is set.
    ///
    /// Per-request failures are logged and never end the loop. On shutdown
    /// the call waits for in-progress transfers to finish.
    pub fn run(&self) -> Result<(), TransferError> {
        info!(
            "Server running on {} serving {:?}",
            self.local_addr()?,
            self.config.root
        );
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        thread::scope(|scope| {
            while !self.shutdown.load(Ordering::Relaxed) {
                match self.socket.recv_from(&mut buffer) {
                    Ok((len, addr)) => self.dispatch(scope, &buffer[..len], addr),
                    Err(e) if is_timeout(&e) => continue,
                    Err(e) => {
                        error!("Recvfrom failed: {}", e);
                        thread::sleep(POLL_INTERVAL);
                    }
                }
            }
        });

        info!("Server on {} stopped", self.local_addr()?);
        Ok(())
    }

    fn dispatch<'scope, 'env>(
        &'scope self,
        scope: &'scope Scope<'scope, 'env>,
        datagram: &[u8],
        addr: SocketAddr,
    ) {
        if self.sessions.forward(addr, datagram) {
            return;
        }

        let packet = match transport::decode(datagram) {
            Ok(packet) => packet,
            Err(DecodeError::TruncatedPayload { declared, .. })
                if datagram.first() == Some(&(MessageType::Get as u8)) =>
            {
                // The name did not fit in the receive buffer.
                warn!("GET from {} with a {} byte name refused", addr, declared);
                self.reply_error(addr, INVALID_FILE_NAME);
                return;
            }
            Err(e) => {
                debug!("Unpacking error from {}: {}", addr, e);
                return;
            }
        };
        if packet.header.kind != MessageType::Get {
            debug!(
                "Ignoring {} from {} with no active session",
                packet.header.kind, addr
            );
            return;
        }

        let filename = packet.payload_text();
        let Some((id, inbox_rx)) = self.sessions.register(addr, self.max_sessions()) else {
            warn!(
                "Max sessions reached, refusing request for {:?} from {}",
                filename, addr
            );
            self.reply_error(addr, SERVER_BUSY);
            return;
        };

        info!("GET {:?} from {}", filename, addr);
        let sessions = self.sessions.clone();
        let link = SessionLink::new(self.socket.clone(), addr, inbox_rx)
            .on_close(move || sessions.release(addr, id));
        scope.spawn(move || {
            let result = serve_request(
                link,
                &self.config.root,
                &filename,
                self.config.sender.clone(),
            );

            match result {
                Ok(summary) => info!(
                    "Sent {:?} to {}: {} chunks, {} bytes, {} retransmissions, sha256 {}",
                    filename,
                    addr,
                    summary.chunks,
                    summary.bytes,
                    summary.retransmissions,
                    to_hex(&summary.digest)
                ),
                Err(e) => warn!("Transfer of {:?} to {} failed: {}", filename, addr, e),
            }
        });
    }

    fn reply_error(&self, addr: SocketAddr, reason: &str) {
        let packet = transport::encode(MessageType::Err, 0, reason.as_bytes());
        if let Err(e) = self.socket.send_to(&packet, addr) {
            warn!("Failed to send ERR to {}: {}", addr, e);
        }
    }

    fn max_sessions(&self) -> usize {
        self.config.max_sessions.clamp(1, MAX_SESSIONS_CAP)
    }
}
