//! Wire messages exchanged between the coordinator and participant servers

use serde::{Deserialize, Serialize};

use crate::coordinator::types::TxnId;
use super::constants::NONCE_LEN;

/// Connection setup, in order: `Hello` (server), `Auth` (client), then
/// `AuthOk` or `AuthFailed` (server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handshake {
    Hello {
        version: u16,
        nonce: [u8; NONCE_LEN],
        server_name: String,
    },
    Auth {
        /// SHA-256 over nonce followed by the shared secret
        digest: [u8; 32],
    },
    AuthOk,
    AuthFailed { reason: String },
}

/// Coordinator to participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Prepare { tx_id: TxnId },
    Commit { tx_id: TxnId },
    Rollback { tx_id: TxnId },
    Ping,
    /// Close the connection; no response follows
    Quit,
}

impl Request {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Prepare { .. } => "prepare",
            Request::Commit { .. } => "commit",
            Request::Rollback { .. } => "rollback",
            Request::Ping => "ping",
            Request::Quit => "quit",
        }
    }
}

/// Participant to coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Prepare { success: bool, error_message: String },
    Commit { success: bool, error_message: String },
    Rollback { success: bool, error_message: String },
    Pong,
    /// The server could not make sense of the request
    Error { message: String },
}

impl Response {
    /// Build the reply matching `request` from a participant call's result
    pub fn for_request(request: &Request, result: std::result::Result<(), String>) -> Self {
        let (success, error_message) = match result {
            Ok(()) => (true, String::new()),
            Err(message) => (false, message),
        };
        match request {
            Request::Prepare { .. } => Response::Prepare { success, error_message },
            Request::Commit { .. } => Response::Commit { success, error_message },
            Request::Rollback { .. } => Response::Rollback { success, error_message },
            Request::Ping => Response::Pong,
            Request::Quit => Response::Error {
                message: "quit has no response".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_matches_request() {
        let tx_id = TxnId::from("tx-1");
        let resp = Response::for_request(&Request::Prepare { tx_id: tx_id.clone() }, Ok(()));
        assert_eq!(
            resp,
            Response::Prepare {
                success: true,
                error_message: String::new()
            }
        );

        let resp = Response::for_request(&Request::Commit { tx_id }, Err("not prepared".to_string()));
        assert_eq!(
            resp,
            Response::Commit {
                success: false,
                error_message: "not prepared".to_string()
            }
        );
    }

    #[test]
    fn test_request_survives_bincode() {
        let request = Request::Rollback {
            tx_id: TxnId::from("transfer-1700000000000-deadbeef"),
        };
        let bytes = bincode::serialize(&request).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.kind(), "rollback");
    }
}
