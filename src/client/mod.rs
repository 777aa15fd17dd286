//! Client library: one request-reply exchange with the master per
//! operation, with key/value bounds rejected before any network round trip.

use tokio::time::Duration;

use crate::utils::{
    connect_with_timeout, recv_msg_timeout, send_msg, TandemError,
};
use crate::wire::{check_key, check_value, Message};

/// Handle to a tandem cluster, addressed by its master.
#[derive(Debug, Clone)]
pub struct KvClient {
    /// Master client-API address, `"host:port"`.
    master_addr: String,

    /// Per-call network timeout.
    timeout: Duration,
}

impl KvClient {
    pub fn new(master_addr: String, timeout: Duration) -> Self {
        KvClient {
            master_addr,
            timeout,
        }
    }

    /// Reads the value of `key`.
    pub async fn get(&self, key: &str) -> Result<String, TandemError> {
        check_key(key)?;
        match self.call(&Message::GetReq { key: key.into() }).await? {
            Message::Resp {
                value: Some(value),
                error: None,
            } => Ok(value),
            Message::Resp {
                error: Some(error), ..
            } => Err(error),
            _ => Err(TandemError::InvalidFormat),
        }
    }

    /// Writes `value` into `key`, replicated across the cluster.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(), TandemError> {
        check_key(key)?;
        check_value(value)?;
        let req = Message::PutReq {
            key: key.into(),
            value: value.into(),
        };
        match self.call(&req).await? {
            Message::Resp { error: None, .. } => Ok(()),
            Message::Resp {
                error: Some(error), ..
            } => Err(error),
            _ => Err(TandemError::InvalidFormat),
        }
    }

    /// Deletes `key` across the cluster.
    pub async fn del(&self, key: &str) -> Result<(), TandemError> {
        check_key(key)?;
        match self.call(&Message::DelReq { key: key.into() }).await? {
            Message::Resp { error: None, .. } => Ok(()),
            Message::Resp {
                error: Some(error), ..
            } => Err(error),
            _ => Err(TandemError::InvalidFormat),
        }
    }

    /// One framed request-reply exchange over a fresh connection.
    async fn call(&self, req: &Message) -> Result<Message, TandemError> {
        let mut conn =
            connect_with_timeout(self.master_addr.as_str(), self.timeout)
                .await?;
        send_msg(&mut conn, req).await?;
        recv_msg_timeout(&mut conn, self.timeout).await
    }
}
