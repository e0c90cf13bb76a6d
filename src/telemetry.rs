//! Where samples go: the telemetry log and the live display.

use core::fmt;
use std::io::Write;

use tracing::info;

/// One row of telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusSample {
    /// Seconds since the procedure started.
    pub elapsed_seconds: f64,
    /// Tenths of a degree.
    pub set_temperature: u16,
    /// Tenths of a degree.
    pub measured_temperature: u16,
    /// rpm.
    pub set_speed: u16,
    /// rpm.
    pub measured_speed: u16,
    pub heating_on: bool,
}

fn tenths(value: u16) -> impl fmt::Display {
    struct Tenths(u16);
    impl fmt::Display for Tenths {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}.{}", self.0 / 10, self.0 % 10)
        }
    }
    Tenths(value)
}

/// Console style summary, e.g. `Time: 12.345; Set temp: 25.0; Act temp: 24.8; Set speed: 300; Act speed: 298`.
impl fmt::Display for StatusSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Time: {:.3}; Set temp: {}; Act temp: {}; Set speed: {}; Act speed: {}",
            self.elapsed_seconds,
            tenths(self.set_temperature),
            tenths(self.measured_temperature),
            self.set_speed,
            self.measured_speed,
        )
    }
}

/// Append-only store for samples, in time order.
pub trait TelemetrySink {
    fn record(&mut self, sample: &StatusSample) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl TelemetrySink for Vec<StatusSample> {
    fn record(&mut self, sample: &StatusSample) -> std::io::Result<()> {
        self.push(*sample);
        Ok(())
    }
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for &mut T {
    fn record(&mut self, sample: &StatusSample) -> std::io::Result<()> {
        (**self).record(sample)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (**self).flush()
    }
}

/// Tab separated telemetry log.
///
/// Columns: elapsed seconds, set temperature, measured temperature, set speed,
/// measured speed, heating (0 or 1). Every row is flushed as it is written so
/// a crash keeps everything recorded so far.
pub struct TsvLog<W: Write> {
    writer: W,
}

impl<W: Write> TsvLog<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl TsvLog<std::fs::File> {
    /// Create (or truncate) a log file.
    pub fn create(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(Self::new(std::fs::File::create(path)?))
    }
}

impl<W: Write> TelemetrySink for TsvLog<W> {
    fn record(&mut self, sample: &StatusSample) -> std::io::Result<()> {
        writeln!(
            self.writer,
            "{}\t{}\t{}\t{}\t{}\t{}",
            sample.elapsed_seconds,
            sample.set_temperature,
            sample.measured_temperature,
            sample.set_speed,
            sample.measured_speed,
            u8::from(sample.heating_on),
        )?;
        self.writer.flush()
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Live view of the latest sample.
pub trait LiveDisplay {
    fn show(&mut self, sample: &StatusSample);
}

/// No display.
impl LiveDisplay for () {
    fn show(&mut self, _sample: &StatusSample) {}
}

/// Shows each sample as an `info` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDisplay;

impl LiveDisplay for TracingDisplay {
    fn show(&mut self, sample: &StatusSample) {
        info!(heating = sample.heating_on, "{sample}");
    }
}
