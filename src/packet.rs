//! Encoding and decoding of the hotplate's fixed-length binary packets.
//!
//! Every outbound packet is 6 bytes:
//!
//! | Byte | Meaning                         |
//! |------|---------------------------------|
//! | 0    | Header, `0xFE`                  |
//! | 1    | Opcode, see [`Opcode`]          |
//! | 2-3  | Big-endian payload value        |
//! | 4    | Reserved, always `0x00`         |
//! | 5    | Checksum                        |
//!
//! Replies start with `0xFD`. Set commands are acknowledged with a 6-byte
//! frame, the two status queries are answered with 11 bytes.
//!
//! The checksum is the least significant byte of the sum of every byte from
//! the opcode up to the checksum itself. The header is not summed, which is
//! why the fixed query `FE A2 00 00 00 A2` carries `0xA2` as its checksum.

use core::fmt;

use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Length of every packet sent to the device, and of set acknowledgements.
pub const PACKET_LEN: usize = 6;

/// Length of the replies to [`Opcode::QueryStatus`] and [`Opcode::QueryHeating`].
pub const STATUS_REPLY_LEN: usize = 11;

/// Header byte of host to device packets.
pub const HOST_HEADER: u8 = 0xFE;

/// Header byte of device to host packets.
pub const DEVICE_HEADER: u8 = 0xFD;

/// Value of the heating flag (byte 4 of a heating reply) when the heating relay
/// is de-energized. Any other value means the relay is energized.
///
/// The interlock in [`crate::engine`] resends the temperature setpoint when it
/// reads this value while a non-zero temperature is commanded.
pub const HEATING_RELAY_OFF: u8 = 0x00;

/// Query for set and measured temperature and speed.
pub const STATUS_QUERY: Packet = Packet::query(Opcode::QueryStatus);

/// Query for the heating relay state.
pub const HEATING_QUERY: Packet = Packet::query(Opcode::QueryHeating);

/// Errors raised while building or parsing packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Setpoint {value} does not fit in an unsigned 16-bit payload")]
    Encoding { value: i64 },
    #[error("Reply too short, expected {expected} bytes but got {received}")]
    Decoding { expected: usize, received: usize },
    #[error("Invalid hex packet: {0}")]
    InvalidHex(&'static str),
}

/// Opcodes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
#[repr(u8)]
pub enum Opcode {
    /// Heating relay state query.
    QueryHeating = 0xA1,
    /// Setpoint and measurement query.
    QueryStatus = 0xA2,
    /// Set the stirring speed in rpm.
    SetSpeed = 0xB1,
    /// Set the temperature in tenths of a degree.
    SetTemperature = 0xB2,
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value as u8
    }
}

/// The two quantities a recipe can control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum Axis {
    /// Plate temperature, in tenths of a degree Celsius.
    #[strum(serialize = "t", to_string = "temperature")]
    Temperature,
    /// Stirring speed, in rpm.
    #[strum(serialize = "s", to_string = "speed")]
    Speed,
}

impl Axis {
    /// Opcode used to set this axis.
    pub const fn set_opcode(self) -> Opcode {
        match self {
            Axis::Temperature => Opcode::SetTemperature,
            Axis::Speed => Opcode::SetSpeed,
        }
    }
}

/// A setpoint for one axis, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    axis: Axis,
    target: u16,
}

impl Command {
    /// Create a command, rejecting targets the device cannot represent.
    pub fn new(axis: Axis, target: i64) -> Result<Self, CodecError> {
        let target = u16::try_from(target).map_err(|_| CodecError::Encoding { value: target })?;
        Ok(Self { axis, target })
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    /// Encode into the packet sent on the wire.
    pub fn to_packet(&self) -> Packet {
        Packet::new(self.axis.set_opcode(), self.target)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set {} to {}", self.axis, self.target)
    }
}

/// A 6-byte host to device packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet([u8; PACKET_LEN]);

impl Packet {
    /// Build a packet with a correct checksum.
    pub const fn new(opcode: Opcode, value: u16) -> Self {
        let [hi, lo] = value.to_be_bytes();
        let mut bytes = [HOST_HEADER, opcode as u8, hi, lo, 0x00, 0x00];
        // const context, so no iterator sum here
        let sum = (opcode as u16) + (hi as u16) + (lo as u16);
        bytes[PACKET_LEN - 1] = (sum & 0xFF) as u8;
        Self(bytes)
    }

    const fn query(opcode: Opcode) -> Self {
        Self::new(opcode, 0)
    }

    /// Wrap raw bytes as they are, without touching the checksum.
    ///
    /// Used for the vendor initialization packets which are sent verbatim.
    pub const fn from_bytes(bytes: [u8; PACKET_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a packet written as 12 hex digits, e.g. `FEA2000000A2`.
    pub fn from_hex(hex: &str) -> Result<Self, CodecError> {
        let hex = hex.trim();
        if hex.len() != PACKET_LEN * 2 {
            return Err(CodecError::InvalidHex("expected 12 hex digits"));
        }
        if !hex.is_ascii() {
            return Err(CodecError::InvalidHex("non-ASCII character"));
        }

        let mut bytes = [0u8; PACKET_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| CodecError::InvalidHex("not a hex digit"))?;
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_LEN] {
        &self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0[1]
    }

    /// Big-endian payload value.
    pub fn value(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    /// The checksum carried by the packet.
    pub fn checksum(&self) -> u8 {
        self.0[PACKET_LEN - 1]
    }

    /// Check the trailing byte against [`checksum`] of the payload.
    pub fn verify_checksum(&self) -> bool {
        checksum(&self.0[1..PACKET_LEN - 1]) == self.checksum()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Least significant byte of the sum of `payload`.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Build the packet that sets `axis` to `target`.
pub fn encode_set(axis: Axis, target: i64) -> Result<Packet, CodecError> {
    Ok(Command::new(axis, target)?.to_packet())
}

/// Decoded contents of a general status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusReply {
    /// Speed setpoint, rpm.
    pub set_speed: u16,
    /// Measured speed, rpm.
    pub measured_speed: u16,
    /// Temperature setpoint, tenths of a degree.
    pub set_temperature: u16,
    /// Measured temperature, tenths of a degree.
    pub measured_temperature: u16,
}

impl StatusReply {
    /// Setpoint currently held by the device for `axis`.
    pub fn setpoint(&self, axis: Axis) -> u16 {
        match axis {
            Axis::Temperature => self.set_temperature,
            Axis::Speed => self.set_speed,
        }
    }
}

fn ensure_status_len(bytes: &[u8]) -> Result<(), CodecError> {
    if bytes.len() < STATUS_REPLY_LEN {
        return Err(CodecError::Decoding {
            expected: STATUS_REPLY_LEN,
            received: bytes.len(),
        });
    }
    Ok(())
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

/// Decode an 11-byte general status reply.
///
/// The reply checksum is not validated; the device's framing is trusted.
pub fn decode_status(bytes: &[u8]) -> Result<StatusReply, CodecError> {
    ensure_status_len(bytes)?;
    Ok(StatusReply {
        set_speed: be_u16(bytes, 2),
        measured_speed: be_u16(bytes, 4),
        set_temperature: be_u16(bytes, 6),
        measured_temperature: be_u16(bytes, 8),
    })
}

/// Decode an 11-byte heating reply. Returns `true` when the relay is energized.
pub fn decode_heating(bytes: &[u8]) -> Result<bool, CodecError> {
    ensure_status_len(bytes)?;
    Ok(bytes[4] != HEATING_RELAY_OFF)
}

fn seal_reply(mut bytes: [u8; STATUS_REPLY_LEN]) -> [u8; STATUS_REPLY_LEN] {
    bytes[STATUS_REPLY_LEN - 1] = checksum(&bytes[1..STATUS_REPLY_LEN - 1]);
    bytes
}

/// Build the device's answer to [`STATUS_QUERY`].
pub fn encode_status_reply(reply: &StatusReply) -> [u8; STATUS_REPLY_LEN] {
    let mut bytes = [0u8; STATUS_REPLY_LEN];
    bytes[0] = DEVICE_HEADER;
    bytes[1] = Opcode::QueryStatus.into();
    bytes[2..4].copy_from_slice(&reply.set_speed.to_be_bytes());
    bytes[4..6].copy_from_slice(&reply.measured_speed.to_be_bytes());
    bytes[6..8].copy_from_slice(&reply.set_temperature.to_be_bytes());
    bytes[8..10].copy_from_slice(&reply.measured_temperature.to_be_bytes());
    seal_reply(bytes)
}

/// Build the device's answer to [`HEATING_QUERY`].
pub fn encode_heating_reply(heating_on: bool) -> [u8; STATUS_REPLY_LEN] {
    let mut bytes = [0u8; STATUS_REPLY_LEN];
    bytes[0] = DEVICE_HEADER;
    bytes[1] = Opcode::QueryHeating.into();
    bytes[4] = if heating_on { 0x01 } else { HEATING_RELAY_OFF };
    seal_reply(bytes)
}

/// Build the 6-byte acknowledgement the device sends after a set command.
pub fn encode_ack(opcode: u8) -> [u8; PACKET_LEN] {
    [DEVICE_HEADER, opcode, 0x00, 0x00, 0x00, opcode]
}
