//! Serving side of a single transfer.
//!
//! The engine keeps at most `window_size` DATA packets in flight. Each ACK
//! removes its chunk from the window and, while the source has bytes left,
//! sends exactly one new chunk. NAKs resend the stored datagram unchanged, and
//! a quiet period of `retransmit_timeout` resends the whole window. A chunk
//! that needs more than `max_retransmits` resends ends the session with a FIN
//! carrying a diagnostic.

use crate::{
    connection::PeerLink,
    file::{resolve_requested_path, utils::ChunkReader},
    stream::error::TransferError,
    transport::{self, MAX_CHUNK, MAX_PAYLOAD, MessageType},
};
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, Read},
    path::Path,
    time::{Duration, Instant},
};

pub const DEFAULT_WINDOW_SIZE: usize = 5;
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRANSMITS: u32 = 5;

/// Reason sent to the client when the requested file cannot be opened.
pub const FILE_NOT_FOUND: &str = "File not found";
/// Reason sent to the client when the requested name is rejected.
pub const INVALID_FILE_NAME: &str = "Invalid file name";

/// Tuning knobs for one sender session.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum number of unacknowledged DATA packets.
    pub window_size: usize,
    /// Bytes per DATA payload.
    pub chunk_size: usize,
    /// Quiet period after which the whole window is resent.
    pub retransmit_timeout: Duration,
    /// Resends allowed per chunk before the transfer is abandoned.
    pub max_retransmits: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            chunk_size: MAX_PAYLOAD,
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
        }
    }
}

impl SenderConfig {
    /// Clamps values the wire format or the protocol cannot honour.
    ///
    /// The window holds at least one packet, and chunks are between 1 and
    /// [`MAX_CHUNK`] bytes so every DATA datagram fits the peer's receive
    /// buffer.
    pub fn normalized(self) -> Self {
        let normalized = Self {
            window_size: self.window_size.max(1),
            chunk_size: self.chunk_size.clamp(1, MAX_CHUNK),
            ..self
        };
        if normalized.window_size != self.window_size || normalized.chunk_size != self.chunk_size {
            warn!(
                "Adjusted sender config: window {} -> {}, chunk size {} -> {}",
                self.window_size, normalized.window_size, self.chunk_size, normalized.chunk_size
            );
        }
        normalized
    }
}

/// Totals reported once a transfer finishes successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferSummary {
    pub chunks: u32,
    pub bytes: u64,
    pub retransmissions: u64,
    /// SHA-256 of every byte sent.
    pub digest: [u8; 32],
}

pub struct SenderEngine<R, L> {
    reader: ChunkReader<R>,
    link: L,
    config: SenderConfig,
    next_seq: u32,
    /// In-flight seq -> the exact datagram that was sent for it.
    window: BTreeMap<u32, Vec<u8>>,
    retransmit_count: HashMap<u32, u32>,
    source_exhausted: bool,
    retransmissions: u64,
    hasher: Sha256,
}

impl<R: Read, L: PeerLink> SenderEngine<R, L> {
    pub fn new(reader: R, link: L, config: SenderConfig) -> Self {
        Self {
            reader: ChunkReader::new(reader),
            link,
            window: BTreeMap::new(),
            retransmit_count: HashMap::new(),
            next_seq: 0,
            source_exhausted: false,
            retransmissions: 0,
            hasher: Sha256::new(),
            config: config.normalized(),
        }
    }

    /// Number of DATA packets awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    /// Sequence number the next new chunk will carry.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// True once every chunk has been read and acknowledged.
    pub fn is_complete(&self) -> bool {
        self.source_exhausted && self.window.is_empty()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Fills the window from the source.
    pub fn start(&mut self) -> Result<(), TransferError> {
        while self.window.len() < self.config.window_size {
            if !self.send_next_chunk()? {
                break;
            }
        }
        debug!(
            "Initial window to {}: {} packets in flight",
            self.link.peer(),
            self.window.len()
        );
        Ok(())
    }

    /// Handles ACK(seq). ACKs for chunks outside the window are ignored.
    pub fn on_ack(&mut self, seq: u32) -> Result<(), TransferError> {
        if self.window.remove(&seq).is_none() {
            debug!("Ignoring ACK for seq {} not in window", seq);
            return Ok(());
        }
        self.retransmit_count.remove(&seq);
        debug!("ACK seq {} ({} in flight)", seq, self.window.len());

        self.send_next_chunk()?;
        Ok(())
    }

    /// Handles NAK(seq) by resending the stored datagram for `seq`.
    pub fn on_nak(&mut self, seq: u32) -> Result<(), TransferError> {
        let Some(datagram) = self.window.get(&seq) else {
            debug!("Ignoring NAK for seq {} not in window", seq);
            return Ok(());
        };
        let datagram = datagram.clone();

        self.charge_retransmit(seq)?;
        info!("Resending packet of sequence {}", seq);
        self.link.send(&datagram)?;
        self.retransmissions += 1;
        Ok(())
    }

    /// Handles a retransmission timeout by resending the whole window.
    pub fn on_timeout(&mut self) -> Result<(), TransferError> {
        let outstanding: Vec<u32> = self.window.keys().copied().collect();
        for seq in &outstanding {
            self.charge_retransmit(*seq)?;
        }

        warn!(
            "Retransmission timeout, resending {} packets to {}",
            outstanding.len(),
            self.link.peer()
        );
        for datagram in self.window.values() {
            self.link.send(datagram)?;
            self.retransmissions += 1;
        }
        Ok(())
    }

    /// Drives the transfer to completion.
    ///
    /// Sends FIN and returns a summary once the window drains. Fails with
    /// [`TransferError::RetransmitBudgetExhausted`] (after notifying the peer)
    /// or on any link or source error.
    pub fn run(&mut self) -> Result<TransferSummary, TransferError> {
        self.start()?;
        let mut deadline = Instant::now() + self.config.retransmit_timeout;

        while !self.window.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let datagram = if remaining.is_zero() {
                None
            } else {
                self.link.recv(remaining)?
            };

            let Some(datagram) = datagram else {
                self.on_timeout()?;
                deadline = Instant::now() + self.config.retransmit_timeout;
                continue;
            };

            let packet = match transport::decode(&datagram) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Dropping malformed datagram from {}: {}", self.link.peer(), e);
                    continue;
                }
            };

            match packet.header.kind {
                MessageType::Ack => self.on_ack(packet.header.seq)?,
                MessageType::Nak => self.on_nak(packet.header.seq)?,
                other => {
                    debug!("Ignoring {} during transfer to {}", other, self.link.peer());
                    continue;
                }
            }
            deadline = Instant::now() + self.config.retransmit_timeout;
        }

        self.link.close();
        self.link.send(&transport::encode(MessageType::Fin, 0, &[]))?;
        Ok(TransferSummary {
            chunks: self.next_seq,
            bytes: self.reader.bytes_read(),
            retransmissions: self.retransmissions,
            digest: self.hasher.clone().finalize().into(),
        })
    }

    /// Reads and sends one more chunk. Returns false once the source is empty.
    fn send_next_chunk(&mut self) -> Result<bool, TransferError> {
        if self.source_exhausted {
            return Ok(false);
        }

        let chunk = self
            .reader
            .read_chunk(self.config.chunk_size)
            .map_err(TransferError::ReadFailed)?;
        if chunk.is_empty() {
            self.source_exhausted = true;
            return Ok(false);
        }

        self.hasher.update(&chunk);
        let seq = self.next_seq;
        let datagram = transport::encode(MessageType::Data, seq, &chunk);
        self.link.send(&datagram)?;
        self.window.insert(seq, datagram);
        self.next_seq += 1;
        Ok(true)
    }

    /// Counts one more resend of `seq`, abandoning the transfer over budget.
    fn charge_retransmit(&mut self, seq: u32) -> Result<(), TransferError> {
        let attempts = self.retransmit_count.entry(seq).or_insert(0);
        *attempts += 1;
        if *attempts <= self.config.max_retransmits {
            return Ok(());
        }

        let attempts = *attempts;
        error!(
            "Giving up on {}: seq {} still unacknowledged after {} retransmissions",
            self.link.peer(),
            seq,
            attempts - 1
        );
        let diagnostic = format!("Retransmit budget exhausted for seq {seq}");
        self.link.close();
        // The session is over either way; the peer may simply be gone.
        if let Err(e) = self
            .link
            .send(&transport::encode(MessageType::Fin, 0, diagnostic.as_bytes()))
        {
            warn!("Failed to send FIN to {}: {}", self.link.peer(), e);
        }
        Err(TransferError::RetransmitBudgetExhausted { seq, attempts })
    }
}

/// Serves one GET: resolves `filename` under `root` and streams it to the peer.
///
/// An unopenable file is answered with a single ERR packet. A read failure in
/// the middle of the transfer is reported with a best-effort ERR.
pub fn serve_request<L: PeerLink>(
    mut link: L,
    root: &Path,
    filename: &str,
    config: SenderConfig,
) -> Result<TransferSummary, TransferError> {
    let path = match resolve_requested_path(root, filename) {
        Ok(path) => path,
        Err(e) => {
            warn!("Rejecting request from {}: {}", link.peer(), e);
            link.close();
            link.send(&transport::encode(
                MessageType::Err,
                0,
                INVALID_FILE_NAME.as_bytes(),
            ))?;
            return Err(e.into());
        }
    };

    let opened = File::open(&path).and_then(|file| {
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "requested path is a directory",
            ));
        }
        Ok((file, metadata.len()))
    });
    let (file, size) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Cannot open {:?} for {}: {}", path, link.peer(), e);
            link.close();
            link.send(&transport::encode(
                MessageType::Err,
                0,
                FILE_NOT_FOUND.as_bytes(),
            ))?;
            return Err(TransferError::FileNotFound(filename.to_string()));
        }
    };

    info!("Sending {:?} ({} bytes) to {}", path, size, link.peer());

    let mut engine = SenderEngine::new(BufReader::new(file), link, config);
    let result = engine.run();

    if let Err(TransferError::ReadFailed(e)) = &result {
        let reason = format!("Read error: {e}");
        // Best effort to tell the peer why the stream stopped
        engine.link.close();
        let _ = engine
            .link
            .send(&transport::encode(MessageType::Err, 0, reason.as_bytes()));
    }
    result
}
