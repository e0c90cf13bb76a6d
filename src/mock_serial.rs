//! We use this mocking module in unit tests to emulate the hotplate on the other end of a serial port.

use std::collections::VecDeque;

use crate::{
    clock::{Clock, Duration, Instant},
    init_table::HANDSHAKE_LEN,
    link::Transport,
    packet::{
        Opcode, PACKET_LEN, Packet, StatusReply, encode_ack, encode_heating_reply,
        encode_status_reply,
    },
};

/// Clock that only moves when something waits on it.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now_ms: u64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.now_ms)
    }

    fn delay(&mut self, duration: Duration) {
        self.now_ms += duration.to_millis();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MockSerialError {
    /// Nothing left to read
    #[error("Timeout")]
    Timeout,
    /// Generic simulated error for testing
    #[error("SimulatedError")]
    SimulatedError,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::BrokenPipe,
        }
    }
}

/// Simulated hotplate.
///
/// Answers the handshake by echoing each packet with the device header, then
/// acknowledges set commands and answers the two status queries from its
/// internal setpoints. Measured values track the setpoints.
pub struct MockHotplate {
    /// Every byte written by the host
    written: Vec<u8>,
    /// Bytes of the packet currently being received
    incoming: heapless::Vec<u8, PACKET_LEN>,
    /// Bytes waiting to be read by the host
    outgoing: VecDeque<u8>,
    handshake_seen: usize,
    /// Handshake packet index whose reply gets cut to the given length
    handshake_truncation: Option<(usize, usize)>,
    /// Sent right after the last handshake reply
    handshake_trailer: Vec<u8>,
    /// Replies sent after the handshake
    replies_sent: usize,
    /// (reply index after the handshake, length) pairs of replies to cut short
    truncations: Vec<(usize, usize)>,
    /// (reply index after the handshake, length) pairs of replies whose remaining bytes arrive late
    late_tails: Vec<(usize, usize)>,
    /// Held back bytes, delivered once the host starts transmitting again
    late: VecDeque<u8>,
    /// Stop answering anything after the handshake
    silent: bool,
    /// Bytes dropped by [`Transport::clear_input`]
    discarded: usize,
    /// Set commands received after the handshake
    commands: Vec<Packet>,
    status: StatusReply,
    heating_on: bool,
    /// Heating answers to give before falling back to `heating_on`
    heating_script: VecDeque<bool>,
    should_error_on_write: bool,
    should_error_on_read: bool,
}

impl embedded_io::ErrorType for MockHotplate {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockHotplate {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }

        for &byte in buf {
            self.outgoing.extend(self.late.drain(..));
            self.written.push(byte);
            // Capacity is one packet and we drain it as soon as it fills.
            let _ = self.incoming.push(byte);
            if self.incoming.is_full() {
                let mut bytes = [0u8; PACKET_LEN];
                bytes.copy_from_slice(&self.incoming);
                self.incoming.clear();
                self.handle(Packet::from_bytes(bytes));
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockHotplate {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }
        if self.outgoing.is_empty() {
            return Err(MockSerialError::Timeout);
        }

        let mut count = 0;
        while count < buf.len() {
            match self.outgoing.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Transport for MockHotplate {
    fn clear_input(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }
        self.discarded += self.outgoing.len();
        self.outgoing.clear();
        Ok(())
    }
}

impl MockHotplate {
    /// A hotplate at 25.0 degrees and standstill, heating relay energized.
    pub fn new() -> Self {
        Self::with_setpoints(250, 0)
    }

    pub fn with_setpoints(temperature: u16, speed: u16) -> Self {
        Self {
            written: Vec::new(),
            incoming: heapless::Vec::new(),
            outgoing: VecDeque::new(),
            handshake_seen: 0,
            handshake_truncation: None,
            handshake_trailer: Vec::new(),
            replies_sent: 0,
            truncations: Vec::new(),
            late_tails: Vec::new(),
            late: VecDeque::new(),
            silent: false,
            discarded: 0,
            commands: Vec::new(),
            status: StatusReply {
                set_speed: speed,
                measured_speed: speed,
                set_temperature: temperature,
                measured_temperature: temperature,
            },
            heating_on: true,
            heating_script: VecDeque::new(),
            should_error_on_write: false,
            should_error_on_read: false,
        }
    }

    fn handle(&mut self, packet: Packet) {
        let mut reply: Vec<u8> = if self.handshake_seen < HANDSHAKE_LEN {
            let index = self.handshake_seen;
            self.handshake_seen += 1;
            let mut reply = packet.as_bytes().to_vec();
            reply[0] = crate::packet::DEVICE_HEADER;
            if let Some((at, len)) = self.handshake_truncation {
                if at == index {
                    reply.truncate(len);
                }
            }
            if self.handshake_seen == HANDSHAKE_LEN {
                reply.extend_from_slice(&self.handshake_trailer);
            }
            reply
        } else {
            let mut reply = match packet.opcode() {
                op if op == Opcode::QueryStatus as u8 => encode_status_reply(&self.status).to_vec(),
                op if op == Opcode::QueryHeating as u8 => {
                    let on = self.heating_script.pop_front().unwrap_or(self.heating_on);
                    encode_heating_reply(on).to_vec()
                }
                op if op == Opcode::SetTemperature as u8 => {
                    self.status.set_temperature = packet.value();
                    self.status.measured_temperature = packet.value();
                    self.commands.push(packet);
                    encode_ack(op).to_vec()
                }
                op if op == Opcode::SetSpeed as u8 => {
                    self.status.set_speed = packet.value();
                    self.status.measured_speed = packet.value();
                    self.commands.push(packet);
                    encode_ack(op).to_vec()
                }
                _ => Vec::new(),
            };
            let index = self.replies_sent;
            self.replies_sent += 1;
            if self.silent {
                return;
            }
            if let Some(&(_, len)) = self.late_tails.iter().find(|(at, _)| *at == index) {
                let len = len.min(reply.len());
                self.late.extend(reply.drain(len..));
            }
            match self.truncations.iter().find(|(at, _)| *at == index) {
                Some((_, len)) => reply[..(*len).min(reply.len())].to_vec(),
                None => reply,
            }
        };
        self.outgoing.extend(reply.drain(..));
    }

    /// Get a reference to the data that was written to this mock serial port
    pub fn written_data(&self) -> &[u8] {
        &self.written
    }

    /// Set commands received after the handshake, oldest first.
    pub fn commands(&self) -> &[Packet] {
        &self.commands
    }

    pub fn last_command(&self) -> Option<Packet> {
        self.commands.last().copied()
    }

    pub fn set_temperature(&self) -> u16 {
        self.status.set_temperature
    }

    /// Number of status and heating queries received.
    pub fn query_count(&self) -> usize {
        self.written
            .chunks(PACKET_LEN)
            .skip(HANDSHAKE_LEN)
            .filter(|p| p[1] == Opcode::QueryStatus as u8 || p[1] == Opcode::QueryHeating as u8)
            .count()
    }

    pub fn pending_reply_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Cut the reply to handshake packet `index` to `len` bytes.
    pub fn truncate_handshake_reply(&mut self, index: usize, len: usize) {
        self.handshake_truncation = Some((index, len));
    }

    /// Cut the next reply after the handshake to `len` bytes.
    pub fn truncate_next_reply(&mut self, len: usize) {
        self.truncate_reply(self.replies_sent, len);
    }

    /// Cut reply number `index` (counted from 0 after the handshake) to `len` bytes.
    pub fn truncate_reply(&mut self, index: usize, len: usize) {
        self.truncations.push((index, len));
    }

    /// Follow the last handshake reply with `bytes` nobody asked for.
    pub fn trail_handshake_with(&mut self, bytes: &[u8]) {
        self.handshake_trailer = bytes.to_vec();
    }

    /// Send only `len` bytes of reply number `index`. The rest arrives as
    /// soon as the host writes its next byte.
    pub fn delay_reply_tail(&mut self, index: usize, len: usize) {
        self.late_tails.push((index, len));
    }

    /// Bytes thrown away by the host through [`Transport::clear_input`].
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Stop answering after the handshake.
    pub fn go_silent(&mut self) {
        self.silent = true;
    }

    pub fn set_heating(&mut self, on: bool) {
        self.heating_on = on;
    }

    /// Answer the next heating queries with `states`, in order.
    pub fn script_heating(&mut self, states: &[bool]) {
        self.heating_script.extend(states.iter().copied());
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Axis, STATUS_QUERY, decode_status, encode_set};
    use embedded_io::{Error, Read, Write};

    fn past_handshake() -> MockHotplate {
        let mut mock = MockHotplate::new();
        for i in 0..HANDSHAKE_LEN {
            mock.write(&[0xFE, i as u8, 0, 0, 0, i as u8]).unwrap();
        }
        let mut sink = [0u8; HANDSHAKE_LEN * PACKET_LEN];
        assert_eq!(mock.read(&mut sink).unwrap(), HANDSHAKE_LEN * PACKET_LEN);
        mock
    }

    #[test]
    fn test_handshake_echo() {
        let mut mock = MockHotplate::new();
        mock.write(&[0xFE, 0x11, 0x22, 0x33, 0x44, 0x55]).unwrap();
        let mut buffer = [0u8; 6];
        assert_eq!(mock.read(&mut buffer).unwrap(), 6);
        assert_eq!(buffer, [0xFD, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn test_bytes_arriving_one_at_a_time() {
        let mut mock = past_handshake();
        for byte in STATUS_QUERY.as_bytes() {
            assert_eq!(mock.pending_reply_len(), 0);
            mock.write(&[*byte]).unwrap();
        }
        let mut buffer = [0u8; 11];
        assert_eq!(mock.read(&mut buffer).unwrap(), 11);
        assert_eq!(decode_status(&buffer).unwrap().set_temperature, 250);
    }

    #[test]
    fn test_set_command_updates_state() {
        let mut mock = past_handshake();
        let packet = encode_set(Axis::Speed, 400).unwrap();
        mock.write(packet.as_bytes()).unwrap();
        let mut buffer = [0u8; 6];
        assert_eq!(mock.read(&mut buffer).unwrap(), 6);
        assert_eq!(buffer, [0xFD, 0xB1, 0, 0, 0, 0xB1]);
        assert_eq!(mock.commands(), &[packet]);
    }

    #[test]
    fn test_late_reply_tail() {
        let mut mock = past_handshake();
        mock.delay_reply_tail(0, 4);
        mock.write(STATUS_QUERY.as_bytes()).unwrap();
        let mut buffer = [0u8; 11];
        assert_eq!(mock.read(&mut buffer).unwrap(), 4);
        assert!(matches!(mock.read(&mut buffer), Err(MockSerialError::Timeout)));

        // The tail shows up once the host transmits again.
        mock.write(&[0xFE]).unwrap();
        assert_eq!(mock.pending_reply_len(), 7);
        mock.clear_input().unwrap();
        assert_eq!(mock.pending_reply_len(), 0);
        assert_eq!(mock.discarded(), 7);
    }

    #[test]
    fn test_read_timeout_when_no_data() {
        let mut mock = MockHotplate::new();
        let mut buffer = [0u8; 10];
        let result = mock.read(&mut buffer);
        assert!(matches!(result, Err(MockSerialError::Timeout)));
        assert!(matches!(
            MockSerialError::Timeout.kind(),
            embedded_io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_error_flags() {
        let mut mock = MockHotplate::new();
        mock.set_write_error(true);
        assert!(mock.write(b"test").is_err());
        assert!(mock.flush().is_err());
        mock.set_read_error(true);
        let mut buffer = [0u8; 4];
        assert!(matches!(
            mock.read(&mut buffer),
            Err(MockSerialError::SimulatedError)
        ));
    }

    #[test]
    fn test_virtual_clock() {
        let mut clock = VirtualClock::new();
        assert_eq!(clock.now().ticks(), 0);
        clock.delay(Duration::millis(1_500));
        assert_eq!(clock.now().ticks(), 1_500);
    }
}
