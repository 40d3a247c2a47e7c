//! Host-side client for a simulated device.

use crate::codec::HostCodec;
use crate::protocol::{Command, Response, Status};
use attestation_core::{Checkpoint, Identity, Mutation, Nonce, TamperReport};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device closed the connection")]
    ConnectionClosed,

    #[error("Device answered {status}: {reason}")]
    Rejected { status: Status, reason: String },

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a 64-byte signature, got {0} bytes")]
    InvalidSignatureLength(usize),
}

/// One connection, and therefore one session, to a simulated device.
pub struct DeviceClient {
    framed: Framed<TcpStream, HostCodec>,
}

impl DeviceClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, HostCodec),
        })
    }

    /// Send one command and wait for its response, whatever the status.
    pub async fn send(&mut self, command: Command) -> Result<Response, ClientError> {
        self.framed.send(command).await?;
        match self.framed.next().await {
            Some(response) => Ok(response?),
            None => Err(ClientError::ConnectionClosed),
        }
    }

    /// Ask the device to sign `nonce`.
    pub async fn challenge(&mut self, nonce: &Nonce) -> Result<[u8; 64], ClientError> {
        let payload = self.expect_ok(Command::Challenge(*nonce)).await?;
        payload
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::InvalidSignatureLength(payload.len()))
    }

    pub async fn checkpoint(&mut self) -> Result<Checkpoint, ClientError> {
        self.expect_json(Command::Checkpoint).await
    }

    pub async fn mutate(&mut self, kind: Mutation, value: Option<&str>) -> Result<(), ClientError> {
        self.expect_ok(Command::Mutate {
            kind,
            value: value.map(str::to_string),
        })
        .await?;
        Ok(())
    }

    /// Compare the device state with its checkpoint.
    ///
    /// A missing checkpoint surfaces as [`ClientError::Rejected`] with
    /// [`Status::NoCheckpoint`].
    pub async fn verify_state(&mut self) -> Result<TamperReport, ClientError> {
        self.expect_json(Command::Verify).await
    }

    pub async fn identity(&mut self) -> Result<Identity, ClientError> {
        self.expect_json(Command::Identity).await
    }

    async fn expect_ok(&mut self, command: Command) -> Result<Vec<u8>, ClientError> {
        let response = self.send(command).await?;
        match response.status {
            Status::Ok => Ok(response.payload),
            status => Err(ClientError::Rejected {
                status,
                reason: response.reason(),
            }),
        }
    }

    async fn expect_json<T: DeserializeOwned>(&mut self, command: Command) -> Result<T, ClientError> {
        let payload = self.expect_ok(command).await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("peer", &self.framed.get_ref().peer_addr().ok())
            .finish()
    }
}
