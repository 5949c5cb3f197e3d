//! Requesting side of a transfer.
//!
//! Sends a GET, then validates every DATA packet by checksum, answering with
//! ACK (chunk stored) or NAK (chunk dropped, awaiting a resend). On FIN the
//! stored chunks are written out in sequence order.
//!
//! Chunks are written from seq 0 up to the first missing seq only. A gap
//! truncates the output rather than failing the transfer; the report carries
//! `first_missing` so callers can tell.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
    time::Duration,
};

use log::{debug, info, warn};
use rand::RngCore;

use crate::{
    connection::{PeerLink, UdpLink},
    file::{FileMetadata, error::RequestPathError},
    stream::{error::TransferError, utils::maybe_corrupt},
    transport::{self, MAX_CHUNK, MessageType, crc32},
};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// How long to wait for any packet before giving up on the request.
    pub read_timeout: Duration,
    /// Probability in `[0, 1]` that a DATA payload is corrupted on arrival.
    /// Debug aid for exercising the NAK path; 0 disables it.
    pub corruption_rate: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            corruption_rate: 0.0,
        }
    }
}

/// What happened to one DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// Checksum matched and the chunk was stored.
    Accepted,
    /// Checksum matched but the seq was already stored; the first copy wins.
    Duplicate,
    /// Checksum mismatch; NAK sent, nothing stored.
    Rejected,
}

/// Result of writing the received chunks out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReport {
    pub chunks: u32,
    pub bytes: u64,
    /// First seq that was absent while later chunks were present.
    pub first_missing: Option<u32>,
}

/// How the server ended the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinNotice {
    /// Non-empty when the server aborted, e.g. retransmit budget exhausted.
    pub diagnostic: Option<String>,
}

pub struct ReceiverEngine<L> {
    link: L,
    config: ReceiverConfig,
    received: BTreeMap<u32, Vec<u8>>,
    rng: Box<dyn RngCore>,
}

impl<L: PeerLink> ReceiverEngine<L> {
    pub fn new(link: L, config: ReceiverConfig) -> Self {
        Self::with_rng(link, config, Box::new(rand::rng()))
    }

    /// Like [`ReceiverEngine::new`] with an explicit source of randomness for
    /// the corruption simulator.
    pub fn with_rng(link: L, config: ReceiverConfig, rng: Box<dyn RngCore>) -> Self {
        Self {
            link,
            config,
            received: BTreeMap::new(),
            rng,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Chunks stored so far, keyed by seq.
    pub fn received(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.received
    }

    /// Sends the GET for `filename`.
    ///
    /// Names longer than [`MAX_CHUNK`] bytes would be cut off by the server's
    /// receive buffer and are refused locally.
    pub fn request(&mut self, filename: &str) -> Result<(), TransferError> {
        if filename.len() > MAX_CHUNK {
            return Err(RequestPathError::TooLong {
                len: filename.len(),
                max: MAX_CHUNK,
            }
            .into());
        }
        info!("Requesting {:?} from {}", filename, self.link.peer());
        self.link
            .send(&transport::encode(MessageType::Get, 0, filename.as_bytes()))?;
        Ok(())
    }

    /// Validates one DATA packet and answers it with ACK or NAK.
    pub fn on_data(
        &mut self,
        seq: u32,
        payload: &[u8],
        checksum: u32,
    ) -> Result<DataOutcome, TransferError> {
        if crc32(payload) != checksum {
            warn!("Checksum mismatch for Seq={}", seq);
            self.link.send(&transport::encode(MessageType::Nak, seq, &[]))?;
            return Ok(DataOutcome::Rejected);
        }

        let outcome = if self.received.contains_key(&seq) {
            debug!("Duplicate chunk seq {}", seq);
            DataOutcome::Duplicate
        } else {
            self.received.insert(seq, payload.to_vec());
            DataOutcome::Accepted
        };
        self.link.send(&transport::encode(MessageType::Ack, seq, &[]))?;
        Ok(outcome)
    }

    /// Turns an ERR payload into the request's failure.
    pub fn on_err(&mut self, message: &str) -> TransferError {
        TransferError::Server(message.to_string())
    }

    /// Handles FIN: the receive loop is over.
    pub fn on_fin(&mut self, payload: &[u8]) -> FinNotice {
        let diagnostic = (!payload.is_empty())
            .then(|| String::from_utf8_lossy(payload).into_owned());
        match &diagnostic {
            Some(reason) => warn!("Server ended the transfer early: {}", reason),
            None => debug!("FIN after {} chunks", self.received.len()),
        }
        FinNotice { diagnostic }
    }

    /// Requests `filename` and processes packets until FIN, ERR or timeout.
    ///
    /// No output is written here; call [`ReceiverEngine::assemble`] after a
    /// successful return.
    pub fn run(&mut self, filename: &str) -> Result<FinNotice, TransferError> {
        self.request(filename)?;

        loop {
            let Some(datagram) = self.link.recv(self.config.read_timeout)? else {
                return Err(TransferError::Timeout(self.config.read_timeout));
            };

            let mut packet = match transport::decode(&datagram) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Dropping malformed datagram: {}", e);
                    continue;
                }
            };

            match packet.header.kind {
                MessageType::Data => {
                    maybe_corrupt(
                        &mut packet.payload,
                        self.config.corruption_rate,
                        self.rng.as_mut(),
                    );
                    self.on_data(packet.header.seq, &packet.payload, packet.header.checksum)?;
                }
                MessageType::Err => return Err(self.on_err(&packet.payload_text())),
                MessageType::Fin => return Ok(self.on_fin(&packet.payload)),
                other => debug!("Ignoring unexpected {} from server", other),
            }
        }
    }

    /// Writes chunks 0, 1, 2, ... to `writer`, stopping at the first gap.
    pub fn assemble<W: Write>(&self, writer: &mut W) -> Result<AssemblyReport, TransferError> {
        let mut report = AssemblyReport {
            chunks: 0,
            bytes: 0,
            first_missing: None,
        };

        let mut seq = 0u32;
        while let Some(chunk) = self.received.get(&seq) {
            writer.write_all(chunk)?;
            report.chunks += 1;
            report.bytes += chunk.len() as u64;
            seq += 1;
        }
        writer.flush()?;

        if self.received.keys().next_back().is_some_and(|last| *last > seq) {
            warn!(
                "Missing chunk: Seq={}; {} later chunks were not written",
                seq,
                self.received.range(seq..).count()
            );
            report.first_missing = Some(seq);
        }
        Ok(report)
    }
}

fn resolve_server(server: &str) -> Result<SocketAddr, TransferError> {
    server
        .to_socket_addrs()
        .map_err(|e| TransferError::AddressResolution(format!("{server}: {e}")))?
        .next()
        .ok_or_else(|| TransferError::AddressResolution(server.to_string()))
}

/// Downloads `filename` from `server` into `output`.
///
/// The output file is created only after the server's FIN, so an ERR or a
/// timeout leaves nothing behind.
pub fn receive_file(
    server: &str,
    filename: &str,
    output: &Path,
    config: ReceiverConfig,
) -> Result<AssemblyReport, TransferError> {
    let peer = resolve_server(server)?;
    let link = UdpLink::connect(peer)?;
    debug!("Bound {} for transfer from {}", link.local_addr()?, peer);

    let mut engine = ReceiverEngine::new(link, config);
    engine.run(filename)?;

    let mut writer = BufWriter::new(File::create(output)?);
    let report = engine.assemble(&mut writer)?;
    drop(writer);

    info!(
        "Wrote {} chunks ({} bytes) to {:?}",
        report.chunks, report.bytes, output
    );
    if let Ok(metadata) = FileMetadata::from_file(output) {
        info!("Output sha256 {}", metadata.hash_hex());
    }
    Ok(report)
}
