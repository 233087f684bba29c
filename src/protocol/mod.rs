//! Participant RPC protocol
//!
//! Lets the coordinator drive participants that live in other processes.
//!
//! ## Protocol Overview
//!
//! 1. **Handshake**: server sends `Hello` with a random nonce, client answers
//!    with `Auth` (SHA-256 of nonce and shared secret), server confirms
//! 2. **Command Phase**: client sends `Prepare`/`Commit`/`Rollback`/`Ping`,
//!    server answers each with exactly one response; `Quit` closes
//!
//! ## Frame Format
//! ```text
//! +-------------------+------------------------------------------+
//! | 4 bytes (LE)      | N bytes (N <= 1 MB)                      |
//! | Payload Length    | bincode payload                          |
//! +-------------------+------------------------------------------+
//! ```
//!
//! ## Architecture
//!
//! - `constants`: protocol constants
//! - `packet`: frame I/O
//! - `messages`: handshake, request and response types
//! - `handshake`: challenge/response authentication
//! - `client`: [`RemoteParticipant`], the coordinator-side adapter

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;

use crate::coordinator::participant::Participant;
use crate::error::{Result, TwoPcError};
use crate::ServerConfig;

pub mod constants;
pub mod messages;
mod client;
mod handshake;
mod packet;

pub use client::RemoteParticipant;
pub use handshake::auth_digest;
pub use packet::PacketIO;

use handshake::HandshakeHandler;
use messages::{Request, Response};

/// Serves one coordinator connection against a local participant
pub struct ConnectionHandler {
    io: PacketIO<TcpStream>,
    participant: Arc<dyn Participant>,
    config: ServerConfig,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, participant: Arc<dyn Participant>, config: ServerConfig) -> Self {
        Self {
            io: PacketIO::new(stream),
            participant,
            config,
        }
    }

    /// Run the connection handler (main loop)
    pub async fn run(mut self) -> Result<()> {
        let started = Instant::now();
        HandshakeHandler::new()
            .accept(&mut self.io, &self.config.name, &self.config.secret)
            .await?;
        log::debug!("Handshake completed in {} ms", started.elapsed().as_millis());

        while self.handle_request().await? {}
        Ok(())
    }

    /// Handle a single request.
    /// Returns Ok(true) to continue, Ok(false) once the client is gone
    async fn handle_request(&mut self) -> Result<bool> {
        let payload = match self.io.read_packet().await {
            Ok(p) => p,
            Err(TwoPcError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let request: Request = match bincode::deserialize(&payload) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Malformed request: {}", e);
                self.io
                    .write_message(&Response::Error {
                        message: format!("malformed request: {}", e),
                    })
                    .await?;
                return Ok(true);
            }
        };

        let result = match &request {
            Request::Quit => {
                log::debug!("Client sent QUIT");
                return Ok(false);
            }
            Request::Ping => Ok(()),
            Request::Prepare { tx_id } => self.participant.prepare(tx_id).await,
            Request::Commit { tx_id } => self.participant.commit(tx_id).await,
            Request::Rollback { tx_id } => self.participant.rollback(tx_id).await,
        };

        if let Err(e) = &result {
            log::warn!("{} {} failed: {}", self.participant.name(), request.kind(), e);
        }
        let response = Response::for_request(&request, result.map_err(remote_message));
        self.io.write_message(&response).await?;
        Ok(true)
    }
}

/// Text sent back for a failed call; the client re-wraps it with its own
/// participant name
fn remote_message(err: TwoPcError) -> String {
    match err {
        TwoPcError::Participant { message, .. } => message,
        other => other.to_string(),
    }
}
