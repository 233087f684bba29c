//! Coordinator-side adapter for participants reached over TCP

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::coordinator::participant::Participant;
use crate::coordinator::types::TxnId;
use crate::error::{Result, TwoPcError};
use super::handshake;
use super::messages::{Request, Response};
use super::packet::PacketIO;

/// Default bound for one request/response exchange
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`Participant`] whose calls go to a participant server.
///
/// Holds one connection, opened on first use. Any transport failure or
/// timeout drops it so the next call reconnects. A `success = false` reply is
/// reported as a participant error carrying the remote message.
pub struct RemoteParticipant {
    name: String,
    endpoint: String,
    secret: String,
    rpc_timeout: Duration,
    conn: Mutex<Option<PacketIO<TcpStream>>>,
}

impl RemoteParticipant {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            secret: secret.into(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            conn: Mutex::new(None),
        }
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Round trip a ping, connecting if needed
    pub async fn ping(&self) -> Result<()> {
        match self.call(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn connect(&self) -> Result<PacketIO<TcpStream>> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        stream.set_nodelay(true)?;
        let mut io = PacketIO::new(stream);
        let server_name = handshake::connect(&mut io, &self.secret).await?;
        log::info!("Connected to participant {} ({}) at {}", self.name, server_name, self.endpoint);
        Ok(io)
    }

    /// Send one request and wait for its response under `rpc_timeout`
    async fn call(&self, request: Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;

        let exchange = async {
            if conn.is_none() {
                *conn = Some(self.connect().await?);
            }
            let io = conn
                .as_mut()
                .ok_or_else(|| TwoPcError::Internal("connection missing after connect".to_string()))?;
            io.write_message(&request).await?;
            io.read_message::<Response>().await
        };

        let result = match tokio::time::timeout(self.rpc_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TwoPcError::Rpc {
                endpoint: self.endpoint.clone(),
                message: format!("{} timed out after {:?}", request.kind(), self.rpc_timeout),
            }),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                // The stream may be mid-frame; never reuse it
                *conn = None;
                Err(self.rpc_error(e))
            }
        }
    }

    fn rpc_error(&self, err: TwoPcError) -> TwoPcError {
        match err {
            TwoPcError::Rpc { .. } => err,
            other => TwoPcError::Rpc {
                endpoint: self.endpoint.clone(),
                message: other.to_string(),
            },
        }
    }

    fn unexpected(&self, response: Response) -> TwoPcError {
        TwoPcError::Rpc {
            endpoint: self.endpoint.clone(),
            message: format!("unexpected response {:?}", response),
        }
    }

    fn check(&self, success: bool, error_message: String) -> Result<()> {
        if success {
            Ok(())
        } else {
            Err(TwoPcError::participant(&self.name, error_message))
        }
    }
}

#[async_trait]
impl Participant for RemoteParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, txn_id: &TxnId) -> Result<()> {
        match self.call(Request::Prepare { tx_id: txn_id.clone() }).await? {
            Response::Prepare { success, error_message } => self.check(success, error_message),
            other => Err(self.unexpected(other)),
        }
    }

    async fn commit(&self, txn_id: &TxnId) -> Result<()> {
        match self.call(Request::Commit { tx_id: txn_id.clone() }).await? {
            Response::Commit { success, error_message } => self.check(success, error_message),
            other => Err(self.unexpected(other)),
        }
    }

    async fn rollback(&self, txn_id: &TxnId) -> Result<()> {
        match self.call(Request::Rollback { tx_id: txn_id.clone() }).await? {
            Response::Rollback { success, error_message } => self.check(success, error_message),
            other => Err(self.unexpected(other)),
        }
    }
}
