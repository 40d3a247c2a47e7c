//! Device state and tamper simulation.
//!
//! The measured state of a device is its firmware hash, three security flags
//! and a boot counter. It changes only through explicit mutations, and every
//! mutation is announced to the registered observers.

use crate::types::{hex_array, Hash256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc;
use thiserror::Error;

/// Security configuration flags. Field order is part of the state hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    pub debug_enabled: bool,
    pub secure_boot: bool,
    pub flash_protected: bool,
}

impl Default for SecurityFlags {
    fn default() -> Self {
        Self {
            debug_enabled: false,
            secure_boot: true,
            flash_protected: true,
        }
    }
}

/// Integrity-relevant state of the device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    #[serde(with = "hex_array")]
    pub firmware_hash: Hash256,
    pub flags: SecurityFlags,
    pub boot_count: u64,
}

impl DeviceState {
    /// Apply a tamper mutation.
    ///
    /// `value` is only consulted for [`Mutation::Firmware`]: a 64-character hex
    /// string installs that exact hash, anything else installs a random one.
    /// Outside this crate, mutations go through [`Device::apply_mutation`] so
    /// observers always hear about them.
    pub(crate) fn apply_mutation(&mut self, kind: Mutation, value: Option<&str>) {
        match kind {
            Mutation::Firmware => {
                self.firmware_hash = value
                    .and_then(parse_firmware_hash)
                    .unwrap_or_else(crate::crypto::random_bytes);
            }
            Mutation::Debug => self.flags.debug_enabled = true,
            Mutation::Boot => self.flags.secure_boot = false,
        }
    }

    /// Count a power-on.
    pub(crate) fn record_boot(&mut self) {
        self.boot_count = self.boot_count.saturating_add(1);
    }
}

fn parse_firmware_hash(value: &str) -> Option<Hash256> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(value, &mut hash).ok()?;
    Some(hash)
}

/// Kinds of tampering the simulator can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutation {
    /// Unauthorized reflash: firmware hash replaced.
    Firmware,
    /// Debug port opened.
    Debug,
    /// Secure boot disabled.
    Boot,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Firmware => write!(f, "firmware"),
            Mutation::Debug => write!(f, "debug"),
            Mutation::Boot => write!(f, "boot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown mutation kind: {0}")]
pub struct UnknownMutation(pub String);

impl FromStr for Mutation {
    type Err = UnknownMutation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firmware" => Ok(Mutation::Firmware),
            "debug" => Ok(Mutation::Debug),
            "boot" => Ok(Mutation::Boot),
            other => Err(UnknownMutation(other.to_string())),
        }
    }
}

/// Receives a notification after every state mutation.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, kind: Mutation, state: &DeviceState);
}

impl<F> StateObserver for F
where
    F: Fn(Mutation, &DeviceState) + Send + Sync,
{
    fn state_changed(&self, kind: Mutation, state: &DeviceState) {
        self(kind, state)
    }
}

/// Forwards mutation kinds over a channel for delivery on another thread.
///
/// A disconnected receiver is ignored; notifications are best effort.
pub struct ChannelObserver {
    tx: mpsc::Sender<Mutation>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<Mutation>) -> Self {
        Self { tx }
    }
}

impl StateObserver for ChannelObserver {
    fn state_changed(&self, kind: Mutation, _state: &DeviceState) {
        let _ = self.tx.send(kind);
    }
}

/// A device: its state plus the observers watching it.
pub struct Device {
    state: DeviceState,
    observers: Vec<Box<dyn StateObserver>>,
}

impl Device {
    /// A device in the factory-safe configuration.
    pub fn new() -> Self {
        Self::with_state(DeviceState::default())
    }

    pub fn with_state(state: DeviceState) -> Self {
        Self {
            state,
            observers: Vec::new(),
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Register an observer. Observers run synchronously, in registration order.
    pub fn subscribe(&mut self, observer: Box<dyn StateObserver>) {
        self.observers.push(observer);
    }

    /// Apply a mutation and notify every observer.
    pub fn apply_mutation(&mut self, kind: Mutation, value: Option<&str>) -> &DeviceState {
        self.state.apply_mutation(kind, value);
        for observer in &self.observers {
            observer.state_changed(kind, &self.state);
        }
        &self.state
    }

    pub fn record_boot(&mut self) {
        self.state.record_boot();
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("state", &self.state)
            .field("observers", &self.observers.len())
            .finish()
    }
}
