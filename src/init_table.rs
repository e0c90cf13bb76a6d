//! The vendor initialization table.
//!
//! Before the hotplate accepts commands it has to be sent 16 pre-recorded
//! packets (the exchange in which it reports its model). The packets are
//! vendor data, kept outside the crate in a text file with one packet per
//! line written as 12 hex digits.

use std::path::Path;

use thiserror::Error;

use crate::packet::{CodecError, Packet};

/// Number of packets in the handshake.
pub const HANDSHAKE_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum InitTableError {
    #[error("Could not read initialization table")]
    Io(#[from] std::io::Error),
    #[error("Initialization table line {line}: {source}")]
    Packet {
        line: usize,
        #[source]
        source: CodecError,
    },
    #[error("Initialization table has {0} packets, expected 16")]
    Length(usize),
}

/// The 16 handshake packets, in transmission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTable {
    packets: [Packet; HANDSHAKE_LEN],
}

impl InitTable {
    pub fn new(packets: [Packet; HANDSHAKE_LEN]) -> Self {
        Self { packets }
    }

    /// Parse the table text. Blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, InitTableError> {
        let mut packets: heapless::Vec<Packet, HANDSHAKE_LEN> = heapless::Vec::new();
        let mut count = 0;

        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let packet = Packet::from_hex(line).map_err(|source| InitTableError::Packet {
                line: index + 1,
                source,
            })?;
            count += 1;
            // Keep counting past the limit so the error reports the real length.
            let _ = packets.push(packet);
        }

        if count != HANDSHAKE_LEN {
            return Err(InitTableError::Length(count));
        }
        let packets = packets
            .into_array()
            .map_err(|v| InitTableError::Length(v.len()))?;
        Ok(Self { packets })
    }

    /// Read and parse a table file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InitTableError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }
}
