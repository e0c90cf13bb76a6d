//! This crate drives a DragonLab style magnetic stirrer hotplate over its USB serial link and runs timed heating and stirring procedures on it.
//!
//! A run looks like this:
//! * open the port ([`serial::open`]) and perform the 16-packet handshake from an initialization table ([`init_table::InitTable`])
//! * execute a [`recipe::Procedure`] with a [`engine::ProcedureEngine`], which issues setpoints and samples the device state
//! * every sample is appended to a telemetry log ([`telemetry::TsvLog`]) and shown on a live display
//!
//! The serial port used for hotplate comms should be configured like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//!
//! The device wants a 50 ms pause after every byte it receives, so sending a packet takes 300 ms.
//!
//! Recipes are plain text, one instruction per line:
//! ```text
//! 30 set t 250
//! 60 set s 400
//! 100 ramp t 300
//! 100 ramp t 4 350
//! ```
//! This holds 25.0 degrees for 30 s, then 400 rpm for 60 s, then steps linearly to 30.0 degrees
//! over 100 s (one step per [`engine::EngineConfig::step_size`]) and finally to 35.0 degrees in exactly 4 steps.
//!
//! Temperatures are in tenths of a degree Celsius, speeds in rpm.

pub mod clock;
pub mod engine;
pub mod error;
pub mod init_table;
pub mod link;
pub mod packet;
pub mod recipe;
pub mod sampler;
pub mod serial;
pub mod telemetry;

#[cfg(test)]
mod mock_serial;

pub use engine::{CancelToken, EngineConfig, Outcome, ProcedureEngine};
pub use error::{Error, Result};
pub use init_table::InitTable;
pub use link::{DeviceLink, LinkState, Transport};
pub use recipe::Procedure;
pub use serial::{PortConfig, with_session};
