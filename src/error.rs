//! Our error types for the hotplate link and procedure engine.

use thiserror::Error;

use crate::{
    init_table::InitTableError, link::LinkState, packet::CodecError, recipe::ConfigError,
    recipe::RecipeError,
};

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Custom error type for hotplate communications, generic over the transport's error.
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    #[error("Could not open serial port {port}")]
    Connection {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("Serial communication error")]
    SerialError(I),
    #[error("Communication timeout, expected {expected} bytes but received {received}")]
    Timeout { expected: usize, received: usize },
    #[error("Reply to {opcode:#04X} starts with {header:02X?}")]
    InvalidResponse { opcode: u8, header: [u8; 2] },
    #[error("Cannot read {requested} bytes, frames are at most {max}")]
    InvalidRange { requested: usize, max: usize },
    #[error("Handshake packet {index} got {received} of 6 reply bytes")]
    Handshake { index: usize, received: usize },
    #[error("Link is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        expected: LinkState,
        actual: LinkState,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    InitTable(#[from] InitTableError),
    #[error("Could not write telemetry")]
    Log(#[source] std::io::Error),
}

impl<I: embedded_io::Error> Error<I> {
    /// Whether re-issuing the same query may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::InvalidResponse { .. })
    }
}
