//! Per-connection device session.
//!
//! A session owns one secure element, one device and one checkpoint slot.
//! Commands are handled one at a time, each to completion.

use crate::protocol::{Command, ProtocolError, Response, Status};
use attestation_core::{
    CheckpointError, CheckpointStore, Device, DeviceState, Mutation, SecureElement,
};
use serde::Serialize;
use serde_json::json;

/// What the connection does after sending a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(Response),
    /// Send the response, then close the connection.
    Terminate(Response),
}

impl Outcome {
    pub fn response(&self) -> &Response {
        match self {
            Self::Continue(response) | Self::Terminate(response) => response,
        }
    }

    pub fn into_response(self) -> Response {
        match self {
            Self::Continue(response) | Self::Terminate(response) => response,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminate(_))
    }
}

#[derive(Debug)]
pub struct Session {
    element: SecureElement,
    device: Device,
    checkpoints: CheckpointStore,
}

impl Session {
    /// Power on a device around `element`.
    pub fn new(element: SecureElement) -> Self {
        let mut device = Device::new();
        device.record_boot();
        device.subscribe(Box::new(|kind: Mutation, state: &DeviceState| {
            tracing::info!(
                mutation = %kind,
                firmware_hash = %hex::encode(state.firmware_hash),
                debug_enabled = state.flags.debug_enabled,
                secure_boot = state.flags.secure_boot,
                "device state mutated"
            );
        }));

        Self {
            element,
            device,
            checkpoints: CheckpointStore::new(),
        }
    }

    pub fn state(&self) -> &DeviceState {
        self.device.state()
    }

    /// Handle one decoded command line.
    pub fn handle(&mut self, command: Result<Command, ProtocolError>) -> Outcome {
        let command = match command {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "malformed command");
                return Outcome::Continue(Response::error(Status::Malformed, e));
            }
        };

        tracing::debug!(tag = %command.tag(), "dispatching command");

        match command {
            Command::Challenge(nonce) => match self.element.sign(nonce.as_bytes()) {
                Ok(signature) => Outcome::Continue(Response::ok(signature.to_bytes().to_vec())),
                Err(e) => fatal(e),
            },
            Command::Checkpoint => {
                match self
                    .checkpoints
                    .create_checkpoint(&self.element, self.device.state())
                {
                    Ok(checkpoint) => {
                        tracing::info!(
                            state_hash = %hex::encode(checkpoint.state_hash),
                            "checkpoint taken"
                        );
                        to_json(checkpoint)
                    }
                    Err(e) => fatal(e),
                }
            }
            Command::Mutate { kind, value } => {
                self.device.apply_mutation(kind, value.as_deref());
                Outcome::Continue(Response::ok(Vec::new()))
            }
            Command::Verify => match self
                .checkpoints
                .verify_against_checkpoint(self.device.state())
            {
                Ok(report) => {
                    if !report.verified {
                        tracing::warn!(
                            current_hash = %hex::encode(report.current_hash),
                            checkpoint_hash = %hex::encode(report.checkpoint_hash),
                            "state differs from checkpoint"
                        );
                    }
                    to_json(&report)
                }
                Err(CheckpointError::NoCheckpoint) => Outcome::Continue(Response {
                    status: Status::NoCheckpoint,
                    payload: json!({ "verified": false, "reason": "No checkpoint" })
                        .to_string()
                        .into_bytes(),
                }),
                Err(e) => fatal(e),
            },
            Command::Identity => match self.element.identity() {
                Ok(identity) => to_json(&identity),
                Err(e) => fatal(e),
            },
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Outcome {
    match serde_json::to_vec(value) {
        Ok(payload) => Outcome::Continue(Response::ok(payload)),
        Err(e) => fatal(e),
    }
}

fn fatal(reason: impl std::fmt::Display) -> Outcome {
    tracing::error!(reason = %reason, "fatal session error");
    Outcome::Terminate(Response::error(Status::Fatal, reason))
}
