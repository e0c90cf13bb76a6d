use core::fmt;

use embedded_io::Error as _;
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, Duration, Instant, saturating_since},
    error::{Error, Result},
    init_table::{HANDSHAKE_LEN, InitTable},
    packet::{Command, DEVICE_HEADER, PACKET_LEN, Packet, STATUS_REPLY_LEN},
};

/// Delay after every transmitted byte. The hotplate drops or corrupts
/// command state when bytes arrive faster than this.
pub const BYTE_SPACING: Duration = Duration::from_ticks(50);

/// Upper bound on a single [`DeviceLink::read`].
pub const READ_TIMEOUT: Duration = Duration::from_ticks(1_000);

/// Pause after the handshake before the first command.
pub const SETTLE_DELAY: Duration = Duration::from_ticks(100);

/// Longest frame the device sends.
pub const MAX_FRAME_LEN: usize = STATUS_REPLY_LEN;

/// Bytes received in one read.
pub type Frame = heapless::Vec<u8, MAX_FRAME_LEN>;

/// A byte stream to the hotplate.
pub trait Transport: embedded_io::Read + embedded_io::Write {
    /// Discard bytes received but not yet read.
    fn clear_input(&mut self) -> core::result::Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport released.
    Closed,
    /// Transport open, handshake not yet completed.
    Initializing,
    /// Handshake done, the device accepts commands.
    Ready,
}

/// Replies received during the handshake, in order.
#[derive(Debug, Clone, Default)]
pub struct HandshakeLog {
    replies: heapless::Vec<[u8; PACKET_LEN], HANDSHAKE_LEN>,
}

impl HandshakeLog {
    pub fn replies(&self) -> impl Iterator<Item = &[u8]> {
        self.replies.iter().map(|reply| reply.as_slice())
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

/// Human readable trace: one line per packet with its index and the raw reply.
impl fmt::Display for HandshakeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Initialization")?;
        writeln!(f, "Response received from hotplate:")?;
        for (index, reply) in self.replies.iter().enumerate() {
            write!(f, "{index}")?;
            for byte in reply {
                write!(f, " {byte:02X}")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "Initialization finished")
    }
}

/// You can create a DeviceLink using any interface which implements [embedded_io::Read] & [embedded_io::Write]
/// and can drop pending input ([`Transport`]).
///
/// The link is the only owner of the transport. Packets are sent one byte at a
/// time with [`BYTE_SPACING`] after each byte, and reads are bounded by
/// [`READ_TIMEOUT`]. Commands and queries are only accepted once
/// [`initialize`](Self::initialize) has completed.
pub struct DeviceLink<S: Transport, C: Clock> {
    interface: Option<S>,
    clock: C,
    state: LinkState,
}

impl<S: Transport, C: Clock> DeviceLink<S, C> {
    /// Wrap an already opened transport. The link starts in [`LinkState::Initializing`].
    pub fn new(interface: S, clock: C) -> Self {
        Self {
            interface: Some(interface),
            clock,
            state: LinkState::Initializing,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn delay(&mut self, duration: Duration) {
        self.clock.delay(duration);
    }

    /// Borrow the transport, `None` once closed.
    pub fn interface(&self) -> Option<&S> {
        self.interface.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn interface_mut(&mut self) -> Option<&mut S> {
        self.interface.as_mut()
    }

    /// Run the 16-packet handshake and move to [`LinkState::Ready`].
    pub fn initialize(&mut self, table: &InitTable) -> Result<HandshakeLog, S::Error> {
        self.require(LinkState::Initializing)?;
        info!("Initializing hotplate");

        let mut log = HandshakeLog::default();
        for (index, packet) in table.packets().iter().enumerate() {
            self.send(packet)?;
            let reply = self.read(PACKET_LEN)?;
            info!(index, reply = ?reply.as_slice(), "Handshake reply");
            if reply.len() < PACKET_LEN {
                return Err(Error::Handshake {
                    index,
                    received: reply.len(),
                });
            }
            let mut bytes = [0u8; PACKET_LEN];
            bytes.copy_from_slice(&reply[..PACKET_LEN]);
            // One entry per table packet, so never full here.
            let _ = log.replies.push(bytes);
        }

        self.clock.delay(SETTLE_DELAY);
        self.clear_input()?;
        self.state = LinkState::Ready;
        info!("Hotplate connected");
        Ok(log)
    }

    /// Write a packet, waiting [`BYTE_SPACING`] after every byte.
    pub fn send(&mut self, packet: &Packet) -> Result<(), S::Error> {
        let actual = self.state;
        let Some(interface) = self.interface.as_mut() else {
            return Err(Error::InvalidState {
                expected: LinkState::Ready,
                actual,
            });
        };

        debug!(%packet, "Sending");
        for byte in packet.as_bytes() {
            interface
                .write_all(core::slice::from_ref(byte))
                .map_err(Error::SerialError)?;
            interface.flush().map_err(Error::SerialError)?;
            self.clock.delay(BYTE_SPACING);
        }
        Ok(())
    }

    /// Read up to `n` bytes. `n` above [`MAX_FRAME_LEN`] is an [`Error::InvalidRange`].
    ///
    /// Returns early with fewer bytes when the transport times out or
    /// [`READ_TIMEOUT`] has passed. A short frame is inconclusive: callers
    /// issue a fresh query rather than try to complete it.
    pub fn read(&mut self, n: usize) -> Result<Frame, S::Error> {
        check_frame_len(n)?;
        let actual = self.state;
        let Some(interface) = self.interface.as_mut() else {
            return Err(Error::InvalidState {
                expected: LinkState::Ready,
                actual,
            });
        };

        let mut frame = Frame::new();
        let mut temp_buf = [0u8; MAX_FRAME_LEN];
        let started = self.clock.now();

        while frame.len() < n {
            if saturating_since(self.clock.now(), started) >= READ_TIMEOUT {
                break;
            }
            match interface.read(&mut temp_buf[..n - frame.len()]) {
                Ok(0) => break,
                Ok(bytes_read) => {
                    // Bounded by the slice length above.
                    let _ = frame.extend_from_slice(&temp_buf[..bytes_read]);
                }
                Err(e) => {
                    if matches!(
                        e.kind(),
                        embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut
                    ) {
                        break;
                    }
                    return Err(Error::SerialError(e));
                }
            }
        }

        if frame.len() < n {
            warn!(expected = n, received = frame.len(), "Short read");
        } else {
            debug!(reply = ?frame.as_slice(), "Received");
        }
        Ok(frame)
    }

    /// Send a query and read its `reply_len` byte answer.
    ///
    /// Stale input is dropped before sending. A short answer is reported as
    /// [`Error::Timeout`], one that does not start with the device header and
    /// the query's opcode as [`Error::InvalidResponse`].
    pub fn query(&mut self, packet: &Packet, reply_len: usize) -> Result<Frame, S::Error> {
        self.require(LinkState::Ready)?;
        check_frame_len(reply_len)?;
        self.clear_input()?;
        self.send(packet)?;
        let reply = self.read(reply_len)?;
        if reply.len() < reply_len {
            return Err(Error::Timeout {
                expected: reply_len,
                received: reply.len(),
            });
        }
        if !answers(&reply, packet.opcode()) {
            warn!(reply = ?reply.as_slice(), "Reply out of frame");
            return Err(Error::InvalidResponse {
                opcode: packet.opcode(),
                header: [
                    reply.first().copied().unwrap_or_default(),
                    reply.get(1).copied().unwrap_or_default(),
                ],
            });
        }
        Ok(reply)
    }

    /// Send a setpoint and consume its acknowledgement.
    ///
    /// A missing acknowledgement is only logged: the packet has been
    /// transmitted and setpoints are idempotent.
    pub fn command(&mut self, command: &Command) -> Result<(), S::Error> {
        self.require(LinkState::Ready)?;
        info!(%command, "Setpoint");
        let packet = command.to_packet();
        self.clear_input()?;
        self.send(&packet)?;
        let ack = self.read(PACKET_LEN)?;
        if ack.len() < PACKET_LEN {
            warn!(%command, received = ack.len(), "No confirmation for setpoint");
        } else if !answers(&ack, packet.opcode()) {
            warn!(%command, ack = ?ack.as_slice(), "Unexpected confirmation for setpoint");
        }
        Ok(())
    }

    /// Release the transport. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.interface.take().is_some() {
            info!("Connection closed");
        }
        self.state = LinkState::Closed;
    }

    /// Take the transport back, closing the link.
    pub fn into_inner(mut self) -> Option<S> {
        self.state = LinkState::Closed;
        self.interface.take()
    }

    fn clear_input(&mut self) -> Result<(), S::Error> {
        let actual = self.state;
        let Some(interface) = self.interface.as_mut() else {
            return Err(Error::InvalidState {
                expected: LinkState::Ready,
                actual,
            });
        };
        interface.clear_input().map_err(Error::SerialError)
    }

    fn require(&self, expected: LinkState) -> Result<(), S::Error> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

fn check_frame_len<I: embedded_io::Error>(n: usize) -> Result<(), I> {
    if n > MAX_FRAME_LEN {
        return Err(Error::InvalidRange {
            requested: n,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Device frames open with the header followed by the opcode they answer.
fn answers(frame: &[u8], opcode: u8) -> bool {
    matches!(frame, [DEVICE_HEADER, op, ..] if *op == opcode)
}
