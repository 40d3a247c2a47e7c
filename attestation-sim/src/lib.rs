//! TCP simulator for a robot root of trust.
//!
//! Each connection gets its own secure element, device state and checkpoint
//! slot. The host drives the session with one-line commands (see
//! [`protocol`]) and receives length-prefixed response frames.
//!
//! ## Session Flow
//! 1. Host connects; the device boots (`boot_count` = 1)
//! 2. `I` reports the public identity for enrollment
//! 3. `C<nonce>` signs a verifier challenge
//! 4. `H` checkpoints the current state, `V` compares against it
//! 5. `M<kind>` simulates tampering between the two

pub mod client;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{ClientError, DeviceClient};
pub use codec::{DeviceCodec, HostCodec};
pub use config::{ConfigError, KeyProvisioning, SimConfig};
pub use protocol::{parse_command, Command, ProtocolError, Response, Status};
pub use server::{run_session, serve, spawn};
pub use session::{Outcome, Session};
