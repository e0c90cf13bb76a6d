//! OS serial port transport.

use core::fmt;

use serialport::SerialPort;
use tracing::{info, warn};

use crate::{
    clock::{Clock, SystemClock},
    error::{Error, Result},
    init_table::InitTable,
    link::{DeviceLink, HandshakeLog, READ_TIMEOUT, Transport},
};

/// Default line speed of the hotplate's USB serial adapter.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Which port to open and how fast to talk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Port name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
}

impl PortConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// [std::io::Error] wrapped so it can be used as an [embedded_io::Error].
#[derive(Debug)]
pub struct IoError(std::io::Error);

impl IoError {
    pub fn into_inner(self) -> std::io::Error {
        self.0
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind as Kind;
        use std::io::ErrorKind as StdKind;

        match self.0.kind() {
            StdKind::NotFound => Kind::NotFound,
            StdKind::PermissionDenied => Kind::PermissionDenied,
            StdKind::NotConnected => Kind::NotConnected,
            StdKind::BrokenPipe => Kind::BrokenPipe,
            StdKind::InvalidInput => Kind::InvalidInput,
            StdKind::InvalidData => Kind::InvalidData,
            StdKind::TimedOut => Kind::TimedOut,
            StdKind::Interrupted => Kind::Interrupted,
            StdKind::Unsupported => Kind::Unsupported,
            StdKind::OutOfMemory => Kind::OutOfMemory,
            _ => Kind::Other,
        }
    }
}

/// An opened serial port speaking [embedded_io].
pub struct SerialInterface(Box<dyn SerialPort>);

impl SerialInterface {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self(port)
    }
}

impl embedded_io::ErrorType for SerialInterface {
    type Error = IoError;
}

impl embedded_io::Read for SerialInterface {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for SerialInterface {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

impl Transport for SerialInterface {
    fn clear_input(&mut self) -> core::result::Result<(), Self::Error> {
        self.0
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| IoError(e.into()))
    }
}

/// Open the port 8N1 without flow control, reads bounded by [`READ_TIMEOUT`].
pub fn open(config: &PortConfig) -> Result<DeviceLink<SerialInterface, SystemClock>, IoError> {
    info!(port = %config.port, baud_rate = config.baud_rate, "Opening serial port");
    let port = serialport::new(&config.port, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(std::time::Duration::from_millis(READ_TIMEOUT.to_millis()))
        .open()
        .map_err(|source| Error::Connection {
            port: config.port.clone(),
            source,
        })?;

    Ok(DeviceLink::new(SerialInterface::new(port), SystemClock::new()))
}

/// Initialize `link`, run `f`, then close the link whatever happened.
pub fn session<S, C, T, F>(
    mut link: DeviceLink<S, C>,
    table: &InitTable,
    f: F,
) -> Result<T, S::Error>
where
    S: Transport,
    C: Clock,
    F: FnOnce(&mut DeviceLink<S, C>, &HandshakeLog) -> Result<T, S::Error>,
{
    let result = link
        .initialize(table)
        .and_then(|handshake| f(&mut link, &handshake));
    if let Err(err) = &result {
        warn!(%err, "Closing link after error");
    }
    link.close();
    result
}

/// [`open`] the port and run `f` inside a [`session`].
pub fn with_session<T, F>(config: &PortConfig, table: &InitTable, f: F) -> Result<T, IoError>
where
    F: FnOnce(&mut DeviceLink<SerialInterface, SystemClock>, &HandshakeLog) -> Result<T, IoError>,
{
    session(open(config)?, table, f)
}
