//! Connection authentication
//!
//! The server opens with a random challenge; the client proves it knows the
//! shared secret by answering with SHA-256(nonce || secret). The secret never
//! crosses the wire.

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, TwoPcError};
use super::constants::{NONCE_LEN, PROTOCOL_VERSION};
use super::messages::Handshake;
use super::packet::PacketIO;

/// Server side of the handshake
pub struct HandshakeHandler {
    nonce: [u8; NONCE_LEN],
}

impl HandshakeHandler {
    /// Create a new handshake handler with a random challenge
    pub fn new() -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce);
        Self { nonce }
    }

    /// Run the exchange; on failure the client has already been told why
    pub async fn accept<S>(&self, io: &mut PacketIO<S>, server_name: &str, secret: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        io.write_message(&Handshake::Hello {
            version: PROTOCOL_VERSION,
            nonce: self.nonce,
            server_name: server_name.to_string(),
        })
        .await?;

        let digest = match io.read_message::<Handshake>().await? {
            Handshake::Auth { digest } => digest,
            other => {
                return Err(TwoPcError::Protocol(format!(
                    "expected Auth during handshake, got {:?}",
                    other
                )))
            }
        };

        if digest != auth_digest(&self.nonce, secret) {
            let reason = "invalid credentials".to_string();
            io.write_message(&Handshake::AuthFailed { reason: reason.clone() })
                .await?;
            return Err(TwoPcError::Auth(reason));
        }

        io.write_message(&Handshake::AuthOk).await
    }
}

impl Default for HandshakeHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Client side of the handshake. Returns the server's advertised name.
pub async fn connect<S>(io: &mut PacketIO<S>, secret: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (nonce, server_name) = match io.read_message::<Handshake>().await? {
        Handshake::Hello {
            version,
            nonce,
            server_name,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(TwoPcError::Protocol(format!(
                    "server speaks protocol version {}, expected {}",
                    version, PROTOCOL_VERSION
                )));
            }
            (nonce, server_name)
        }
        other => {
            return Err(TwoPcError::Protocol(format!(
                "expected Hello from server, got {:?}",
                other
            )))
        }
    };

    io.write_message(&Handshake::Auth {
        digest: auth_digest(&nonce, secret),
    })
    .await?;

    match io.read_message::<Handshake>().await? {
        Handshake::AuthOk => Ok(server_name),
        Handshake::AuthFailed { reason } => Err(TwoPcError::Auth(reason)),
        other => Err(TwoPcError::Protocol(format!(
            "unexpected handshake reply {:?}",
            other
        ))),
    }
}

/// SHA-256(nonce || secret)
pub fn auth_digest(nonce: &[u8], secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(secret.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_digest_depends_on_secret_and_nonce() {
        let nonce = [7u8; NONCE_LEN];
        assert_eq!(auth_digest(&nonce, "s3cret"), auth_digest(&nonce, "s3cret"));
        assert_ne!(auth_digest(&nonce, "s3cret"), auth_digest(&nonce, "other"));
        assert_ne!(auth_digest(&nonce, "s3cret"), auth_digest(&[8u8; NONCE_LEN], "s3cret"));
    }

    #[tokio::test]
    async fn test_handshake_accepts_matching_secret() {
        let (client, server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut io = PacketIO::new(server);
            HandshakeHandler::new().accept(&mut io, "ledger-a", "s3cret").await
        });

        let mut io = PacketIO::new(client);
        let name = connect(&mut io, "s3cret").await.unwrap();
        assert_eq!(name, "ledger-a");
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_secret() {
        let (client, server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut io = PacketIO::new(server);
            HandshakeHandler::new().accept(&mut io, "ledger-a", "s3cret").await
        });

        let mut io = PacketIO::new(client);
        let err = connect(&mut io, "guess").await.unwrap_err();
        assert!(matches!(err, TwoPcError::Auth(_)));
        assert!(matches!(server_task.await.unwrap(), Err(TwoPcError::Auth(_))));
    }

    #[tokio::test]
    async fn test_empty_secret_still_exchanges() {
        let (client, server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut io = PacketIO::new(server);
            HandshakeHandler::new().accept(&mut io, "open", "").await
        });

        let mut io = PacketIO::new(client);
        assert_eq!(connect(&mut io, "").await.unwrap(), "open");
        server_task.await.unwrap().unwrap();
    }
}
