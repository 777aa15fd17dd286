//! Wire message vocabulary, size-bound checks, and the connection-handler
//! capability shared by every listener role.
//!
//! One request over a connection produces exactly one reply; the initiator
//! closes the connection afterwards. Three handler variants exist behind
//! [`ConnHandler`]: the master's client-facing handler, the master's
//! registration handler, and the participant's transaction handler.

use std::sync::Arc;

use async_trait::async_trait;

use serde::{Serialize, Deserialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::utils::{TandemError, MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::workers::WorkerPool;

/// Logical message kinds exchanged between client, master, and participants.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Read the value of a key.
    GetReq { key: String },

    /// Propose (or request) writing a value into a key.
    PutReq { key: String, value: String },

    /// Propose (or request) deleting a key.
    DelReq { key: String },

    /// Terminal reply carrying an optional value and/or an optional error.
    Resp {
        value: Option<String>,
        error: Option<TandemError>,
    },

    /// Participant vote: willing to commit the proposed operation.
    Ready,

    /// Coordinator decision: apply the logged proposal.
    Commit,

    /// Either a participant vote against the proposal (with the reason) or
    /// the coordinator's decision to discard it (reason absent).
    Abort { error: Option<TandemError> },

    /// Participant acknowledgement of a Commit/Abort decision.
    Ack,

    /// Participant announcing itself to the master as `"id@host:port"`.
    Register { info: String },
}

impl Message {
    /// Shorthand for a reply carrying a value.
    pub fn resp_value(value: impl ToString) -> Self {
        Message::Resp {
            value: Some(value.to_string()),
            error: None,
        }
    }

    /// Shorthand for a reply signalling plain success.
    pub fn resp_ok() -> Self {
        Message::Resp {
            value: None,
            error: None,
        }
    }

    /// Shorthand for a reply carrying an error kind.
    pub fn resp_err(error: TandemError) -> Self {
        Message::Resp {
            value: None,
            error: Some(error),
        }
    }
}

/// Checks a key against presence and size bounds.
pub fn check_key(key: &str) -> Result<(), TandemError> {
    if key.is_empty() {
        Err(TandemError::InvalidKey)
    } else if key.len() > MAX_KEY_LEN {
        Err(TandemError::OversizedKey)
    } else {
        Ok(())
    }
}

/// Checks a value against presence and size bounds.
pub fn check_value(value: &str) -> Result<(), TandemError> {
    if value.is_empty() {
        Err(TandemError::InvalidValue)
    } else if value.len() > MAX_VALUE_LEN {
        Err(TandemError::OversizedValue)
    } else {
        Ok(())
    }
}

/// Capability of handling one accepted connection end-to-end. The listener
/// that owns the connection selects which concrete handler runs.
#[async_trait]
pub trait ConnHandler: Send + Sync {
    /// Serves one request-reply exchange on `conn`.
    async fn handle(&self, conn: TcpStream) -> Result<(), TandemError>;
}

/// Accept loop: hands each accepted connection to `handler` as one job on
/// `pool`, until the termination channel fires.
pub async fn serve(
    name: &str,
    listener: TcpListener,
    handler: Arc<dyn ConnHandler>,
    pool: Arc<WorkerPool>,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), TandemError> {
    pf_info!(name; "serving on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, addr) = accepted?;
                pf_trace!(name; "accepted connection from {}", addr);
                let handler = handler.clone();
                pool.submit(Box::pin(
                    async move { handler.handle(conn).await },
                ))?;
            },

            _ = rx_term.changed() => {
                pf_warn!(name; "accept loop caught termination signal");
                return Ok(());
            },
        }
    }
}
