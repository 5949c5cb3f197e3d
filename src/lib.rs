//! Reliable, ordered file delivery over UDP.
//!
//! A client sends `GET(name)`, the server answers with a sliding window of
//! `DATA` chunks, the client acknowledges (or rejects) each chunk by checksum,
//! and the server closes the transfer with `FIN` once every chunk is acked.

pub mod cli;
pub mod connection;
pub mod file;
pub mod stream;
pub mod transport;
