//! 2PC participant: votes on proposed writes, applies decided ones, and
//! serves reads from its local write-through facade.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use serde::Deserialize;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::server::{KvServer, WalEntry, WalLog};
use crate::utils::{
    connect_with_timeout, recv_msg, recv_msg_timeout, send_msg, TandemError,
};
use crate::wire::{check_key, check_value, ConnHandler, Message};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Path to the write-ahead log backing file.
    pub wal_path: String,

    /// Path to the storage snapshot file; empty disables snapshotting.
    pub snapshot_path: String,

    /// Number of cache sets.
    pub cache_sets: usize,

    /// Maximum entries per cache set.
    pub cache_ways: usize,

    /// Worker count for the transaction listener. One worker serializes
    /// transactions at the queue; the transaction lock keeps larger pools
    /// correct as well.
    pub workers: usize,

    /// Timeout (and registration retry backoff) in millisecs.
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            wal_path: "/tmp/tandem.wal".into(),
            snapshot_path: "".into(),
            cache_sets: 64,
            cache_ways: 4,
            workers: 1,
            timeout_ms: 3000,
        }
    }
}

impl ServerConfig {
    /// Composes the config from defaults overridden by a TOML string.
    pub fn parse(config_str: Option<&str>) -> Result<Self, TandemError> {
        let config = parsed_config!(config_str => ServerConfig;
                                    wal_path, snapshot_path, cache_sets,
                                    cache_ways, workers, timeout_ms)?;
        if config.timeout_ms == 0 {
            return logged_err!("s"; "invalid config.timeout_ms '{}'",
                                    config.timeout_ms);
        }
        Ok(config)
    }
}

/// Where a participant stands within the current transaction.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TxnPhase {
    /// No proposal in flight.
    Idle,

    /// Voted READY on a logged proposal; awaiting the decision.
    Prepared,

    /// Last decided proposal was committed and applied.
    Committed,

    /// Last decided proposal was aborted.
    Aborted,
}

/// Per-transaction mutable state: the log plus the phase marker. One mutex
/// over both, since the participant handles one transaction at a time.
struct TxnState {
    wal: WalLog,
    phase: TxnPhase,
}

/// Participant server module.
pub struct TxnParticipant {
    /// My participant ID.
    id: u64,

    /// Local write-through cache + store facade.
    kv: Arc<KvServer>,

    /// Transaction state, serialized across in-flight requests.
    txn: Mutex<TxnState>,
}

impl TxnParticipant {
    /// Opens the WAL at `wal_path`, replays committed-but-possibly-unapplied
    /// proposals into the store, and returns the ready participant.
    pub async fn new_and_recover(
        id: u64,
        kv: Arc<KvServer>,
        wal_path: &Path,
    ) -> Result<Self, TandemError> {
        let wal = WalLog::open(id, wal_path).await?;

        // replay is idempotent: re-putting an applied value is a no-op
        // overwrite, and a re-deleted key is simply absent already
        let store = kv.store();
        wal.replay(
            |key, value| store.put(key, value),
            |key| {
                let _ = store.del(key);
            },
        );
        pf_info!(id; "recovery replay done, {} keys live", store.len());

        Ok(TxnParticipant {
            id,
            kv,
            txn: Mutex::new(TxnState {
                wal,
                phase: TxnPhase::Idle,
            }),
        })
    }

    /// My participant ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The local write-through facade (for snapshotting and stats).
    pub fn kv(&self) -> &Arc<KvServer> {
        &self.kv
    }

    /// Current transaction phase (for logging and tests).
    pub async fn phase(&self) -> TxnPhase {
        self.txn.lock().await.phase
    }

    /// Announces this participant to the master as `"id@host:port"` and
    /// checks the confirmation reply.
    pub async fn register_with_master(
        &self,
        master_addr: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), TandemError> {
        let info = format!("{}@{}:{}", self.id, host, port);
        let mut conn = connect_with_timeout(master_addr, timeout).await?;
        send_msg(
            &mut conn,
            &Message::Register { info: info.clone() },
        )
        .await?;

        match recv_msg_timeout(&mut conn, timeout).await? {
            Message::Resp {
                value: Some(confirmation),
                error: None,
            } if confirmation == format!("registered {}", info) => {
                pf_info!(self.id; "registered with master as '{}'", info);
                Ok(())
            }
            Message::Resp {
                error: Some(error), ..
            } => Err(error),
            _ => Err(TandemError::InvalidFormat),
        }
    }

    /// Computes the reply to one request message, walking the participant
    /// state machine where the message is a 2PC phase.
    pub async fn process(&self, req: Message) -> Message {
        match req {
            Message::GetReq { key } => match self.kv.get(&key) {
                Ok(value) => Message::resp_value(value),
                Err(error) => Message::resp_err(error),
            },
            Message::PutReq { key, value } => self.vote_put(key, value).await,
            Message::DelReq { key } => self.vote_del(key).await,
            Message::Commit => self.apply_commit().await,
            Message::Abort { .. } => self.apply_abort().await,
            _ => Message::resp_err(TandemError::InvalidFormat),
        }
    }

    /// Phase 1, put proposal: validate, log, vote. An invalid proposal is
    /// answered ABORT with the specific error and leaves the log untouched.
    async fn vote_put(&self, key: String, value: String) -> Message {
        if let Err(error) = check_key(&key).and(check_value(&value)) {
            return Message::Abort {
                error: Some(error),
            };
        }

        let mut txn = self.txn.lock().await;
        if let Err(e) = txn.wal.append(WalEntry::Put { key, value }).await {
            pf_error!(self.id; "error logging put proposal: {}", e);
            return Message::Abort { error: Some(e) };
        }
        txn.phase = TxnPhase::Prepared;
        Message::Ready
    }

    /// Phase 1, delete proposal: the key must exist in storage right now.
    /// The existence check probes the store, not the cache, so validation
    /// has no cache side effects.
    async fn vote_del(&self, key: String) -> Message {
        if let Err(error) = check_key(&key) {
            return Message::Abort {
                error: Some(error),
            };
        }
        if !self.kv.has_key(&key) {
            return Message::Abort {
                error: Some(TandemError::NoSuchKey),
            };
        }

        let mut txn = self.txn.lock().await;
        if let Err(e) = txn.wal.append(WalEntry::Del { key }).await {
            pf_error!(self.id; "error logging del proposal: {}", e);
            return Message::Abort { error: Some(e) };
        }
        txn.phase = TxnPhase::Prepared;
        Message::Ready
    }

    /// Phase 2, commit decision: log the COMMIT, then apply the proposal
    /// that preceded it. On a retried decision the preceding entry is the
    /// earlier COMMIT itself, so nothing is re-applied and the ack is
    /// simply repeated.
    async fn apply_commit(&self) -> Message {
        let mut txn = self.txn.lock().await;
        let to_apply = txn.wal.last_entry().cloned();
        if let Err(e) = txn.wal.append(WalEntry::Commit).await {
            // not durable, so not ack'able; the coordinator will retry
            pf_error!(self.id; "error logging commit: {}", e);
            return Message::resp_err(e);
        }

        match to_apply {
            Some(WalEntry::Put { key, value }) => {
                if let Err(e) = self.kv.put(&key, &value) {
                    pf_warn!(self.id; "error applying put '{}': {}", key, e);
                }
            }
            Some(WalEntry::Del { key }) => {
                if let Err(e) = self.kv.del(&key) {
                    pf_warn!(self.id; "error applying del '{}': {}", key, e);
                }
            }
            _ => {} // no pending proposal; duplicate decision delivery
        }

        txn.phase = TxnPhase::Committed;
        Message::Ack
    }

    /// Phase 2, abort decision: log the ABORT, touch nothing else.
    async fn apply_abort(&self) -> Message {
        let mut txn = self.txn.lock().await;
        if let Err(e) = txn.wal.append(WalEntry::Abort).await {
            pf_error!(self.id; "error logging abort: {}", e);
            return Message::resp_err(e);
        }
        txn.phase = TxnPhase::Aborted;
        Message::Ack
    }
}

#[async_trait]
impl ConnHandler for TxnParticipant {
    async fn handle(&self, mut conn: TcpStream) -> Result<(), TandemError> {
        let reply = match recv_msg(&mut conn).await {
            Ok(req) => {
                pf_trace!(self.id; "request {:?}", req);
                self.process(req).await
            }
            // garbled bytes terminate only this exchange
            Err(_) => Message::resp_err(TandemError::InvalidFormat),
        };

        // reply best effort; the initiator may have timed out and left
        if let Err(e) = send_msg(&mut conn, &reply).await {
            pf_warn!(self.id; "error sending reply: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod participant_tests {
    use super::*;
    use tokio::fs;

    async fn fresh_participant(
        id: u64,
        path: &str,
    ) -> Result<TxnParticipant, TandemError> {
        if fs::try_exists(path).await? {
            fs::remove_file(path).await?;
        }
        let kv = Arc::new(KvServer::new(4, 2));
        TxnParticipant::new_and_recover(id, kv, Path::new(path)).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn put_votes_ready_then_commits() -> Result<(), TandemError> {
        let p = fresh_participant(0, "/tmp/test-tandem-part-0.wal").await?;
        let vote = p
            .process(Message::PutReq {
                key: "a".into(),
                value: "1".into(),
            })
            .await;
        assert_eq!(vote, Message::Ready);
        assert_eq!(p.phase().await, TxnPhase::Prepared);
        // storage untouched before the decision
        assert!(!p.kv.has_key("a"));

        assert_eq!(p.process(Message::Commit).await, Message::Ack);
        assert_eq!(p.phase().await, TxnPhase::Committed);
        assert_eq!(p.kv.get("a"), Ok("1".into()));
        assert_eq!(
            p.txn.lock().await.wal.last_entry(),
            Some(&WalEntry::Commit)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn invalid_put_aborts_without_logging() -> Result<(), TandemError> {
        let p = fresh_participant(0, "/tmp/test-tandem-part-1.wal").await?;
        assert_eq!(
            p.process(Message::PutReq {
                key: "a".into(),
                value: "".into(),
            })
            .await,
            Message::Abort {
                error: Some(TandemError::InvalidValue),
            }
        );
        assert_eq!(
            p.process(Message::PutReq {
                key: "k".repeat(257),
                value: "1".into(),
            })
            .await,
            Message::Abort {
                error: Some(TandemError::OversizedKey),
            }
        );
        let txn = p.txn.lock().await;
        assert!(txn.wal.entries().is_empty());
        assert_eq!(txn.phase, TxnPhase::Idle);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn del_of_absent_key_aborts() -> Result<(), TandemError> {
        let p = fresh_participant(0, "/tmp/test-tandem-part-2.wal").await?;
        assert_eq!(
            p.process(Message::DelReq { key: "a".into() }).await,
            Message::Abort {
                error: Some(TandemError::NoSuchKey),
            }
        );
        assert!(p.txn.lock().await.wal.entries().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn abort_decision_leaves_storage() -> Result<(), TandemError> {
        let p = fresh_participant(0, "/tmp/test-tandem-part-3.wal").await?;
        assert_eq!(
            p.process(Message::PutReq {
                key: "a".into(),
                value: "1".into(),
            })
            .await,
            Message::Ready
        );
        assert_eq!(
            p.process(Message::Abort { error: None }).await,
            Message::Ack
        );
        assert_eq!(p.phase().await, TxnPhase::Aborted);
        assert!(!p.kv.has_key("a"));
        assert_eq!(
            p.txn.lock().await.wal.last_entry(),
            Some(&WalEntry::Abort)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn duplicate_commit_reacks_without_reapplying(
    ) -> Result<(), TandemError> {
        let p = fresh_participant(0, "/tmp/test-tandem-part-4.wal").await?;
        p.process(Message::PutReq {
            key: "a".into(),
            value: "1".into(),
        })
        .await;
        assert_eq!(p.process(Message::Commit).await, Message::Ack);
        // the ack was lost; the coordinator retries the decision
        assert_eq!(p.process(Message::Commit).await, Message::Ack);
        assert_eq!(p.kv.get("a"), Ok("1".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn unexpected_message_is_invalid_format() -> Result<(), TandemError>
    {
        let p = fresh_participant(0, "/tmp/test-tandem-part-5.wal").await?;
        assert_eq!(
            p.process(Message::Ack).await,
            Message::resp_err(TandemError::InvalidFormat)
        );
        assert_eq!(p.phase().await, TxnPhase::Idle);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn crash_recovery_replays_committed() -> Result<(), TandemError> {
        let path = "/tmp/test-tandem-part-6.wal";
        {
            let p = fresh_participant(0, path).await?;
            p.process(Message::PutReq {
                key: "a".into(),
                value: "1".into(),
            })
            .await;
            p.process(Message::Commit).await;
            // crashed after voting READY, before learning the decision
            p.process(Message::PutReq {
                key: "b".into(),
                value: "2".into(),
            })
            .await;
        }

        let kv = Arc::new(KvServer::new(4, 2));
        let p =
            TxnParticipant::new_and_recover(0, kv.clone(), Path::new(path))
                .await?;
        assert_eq!(kv.get("a"), Ok("1".into()));
        assert!(!kv.has_key("b")); // dangling proposal abandoned
        assert_eq!(p.phase().await, TxnPhase::Idle);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn get_served_from_facade() -> Result<(), TandemError> {
        let p = fresh_participant(0, "/tmp/test-tandem-part-7.wal").await?;
        p.kv.put("a", "1")?;
        assert_eq!(
            p.process(Message::GetReq { key: "a".into() }).await,
            Message::resp_value("1")
        );
        assert_eq!(
            p.process(Message::GetReq { key: "b".into() }).await,
            Message::resp_err(TandemError::NoSuchKey)
        );
        Ok(())
    }
}
