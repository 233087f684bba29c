use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub mod coordinator;
pub mod error;
pub mod participants;
pub mod protocol;

pub use crate::coordinator::{
    spawn_recovery_worker, ChaosMode, CoordinatorConfig, ExecuteOutcome, FileLogStore, LogStore,
    MemoryLogStore, Participant, TransactionManager, TxnId, TxnState,
};
pub use crate::error::{Result, TwoPcError};
pub use crate::participants::LedgerParticipant;
pub use crate::protocol::RemoteParticipant;

use crate::protocol::ConnectionHandler;

/// Participant server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Name advertised to coordinators in the handshake
    pub name: String,
    /// Shared secret coordinators must prove they know
    pub secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], protocol::constants::DEFAULT_PORT)),
            name: "participant".to_string(),
            secret: String::new(),
        }
    }
}

/// Exposes a local [`Participant`] to remote coordinators
pub struct ParticipantServer {
    config: ServerConfig,
    participant: Arc<dyn Participant>,
    listener: TcpListener,
}

impl ParticipantServer {
    /// Bind the listening socket; use port 0 to let the OS choose
    pub async fn bind(config: ServerConfig, participant: Arc<dyn Participant>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        Ok(Self {
            config,
            participant,
            listener,
        })
    }

    /// The address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Accept connections until `token` is cancelled.
    /// Connections already open keep running to completion.
    pub async fn run_until(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Participant {} listening on {}",
            self.config.name,
            self.local_addr()?
        );

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }

                    let participant = Arc::clone(&self.participant);
                    let config = self.config.clone();

                    // Spawn a task to handle this connection
                    tokio::spawn(async move {
                        let handler = ConnectionHandler::new(stream, participant, config);
                        if let Err(e) = handler.run().await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                        info!("Connection closed: {}", addr);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Participant {} stopped accepting connections", self.config.name);
        Ok(())
    }
}
