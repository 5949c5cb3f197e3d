use std::time::Duration;

use thiserror::Error;

use crate::file::error::RequestPathError;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Invalid file name: {0}")]
    InvalidFileName(#[from] RequestPathError),
    #[error("Failed to read source file: {0}")]
    ReadFailed(std::io::Error),
    #[error("Server error: {0}")]
    Server(String),
    #[error("No packet from peer within {0:?}")]
    Timeout(Duration),
    #[error("Retransmit budget exhausted for seq {seq} after {attempts} attempts")]
    RetransmitBudgetExhausted { seq: u32, attempts: u32 },
    #[error("Could not resolve address: {0}")]
    AddressResolution(String),
}
