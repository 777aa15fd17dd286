//! 2PC transaction coordinator: places each write on two replicas, drives
//! prepare/commit (or prepare/abort) across them, and fronts reads with its
//! own cache.

use std::sync::Arc;

use serde::Deserialize;

use tokio::sync::Mutex;
use tokio::time::{self, Duration};

use crate::cache::Cache;
use crate::master::{ParticipantInfo, ReplicaRing};
use crate::utils::{
    connect_with_timeout, recv_msg_timeout, send_msg, TandemError,
};
use crate::wire::Message;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Timeout of every per-participant network call, and the fixed backoff
    /// between phase-2 retries, in millisecs.
    pub timeout_ms: u64,

    /// Number of master cache sets.
    pub cache_sets: usize,

    /// Maximum entries per master cache set.
    pub cache_ways: usize,

    /// Worker count for the client-facing listener.
    pub api_workers: usize,

    /// Worker count for the registration listener.
    pub reg_workers: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            timeout_ms: 3000,
            cache_sets: 16,
            cache_ways: 4,
            api_workers: 8,
            reg_workers: 2,
        }
    }
}

impl MasterConfig {
    /// Composes the config from defaults overridden by a TOML string.
    pub fn parse(config_str: Option<&str>) -> Result<Self, TandemError> {
        let config = parsed_config!(config_str => MasterConfig;
                                    timeout_ms, cache_sets, cache_ways,
                                    api_workers, reg_workers)?;
        if config.timeout_ms == 0 {
            return logged_err!("m"; "invalid config.timeout_ms '{}'",
                                    config.timeout_ms);
        }
        Ok(config)
    }
}

/// Master coordinator module.
pub struct Coordinator {
    /// Participant ring, shared with the registration handler.
    ring: Arc<ReplicaRing>,

    /// Master-side read cache, updated only by committed writes and read
    /// fills.
    cache: Cache,

    /// Per-call network timeout; also the phase-2 retry backoff.
    timeout: Duration,

    /// Serializes the write path; phase 2 of one transaction finishes
    /// cluster-wide before the next transaction's phase 1 starts.
    write_lock: Mutex<()>,
}

impl Coordinator {
    /// Creates a coordinator over `ring` with a fresh cache.
    pub fn new(ring: Arc<ReplicaRing>, config: &MasterConfig) -> Self {
        Coordinator {
            ring,
            cache: Cache::new(config.cache_sets, config.cache_ways),
            timeout: Duration::from_millis(config.timeout_ms),
            write_lock: Mutex::new(()),
        }
    }

    /// The participant ring.
    pub fn ring(&self) -> &Arc<ReplicaRing> {
        &self.ring
    }

    /// Runs one write (put or delete) through 2PC. Returns `Ok(())` on a
    /// cluster-wide commit; on abort, returns the participant-reported
    /// validation error if one was captured, else the generic format error.
    pub async fn handle_write(
        &self,
        key: &str,
        value: Option<&str>,
        is_put: bool,
    ) -> Result<(), TandemError> {
        if is_put && value.is_none() {
            return Err(TandemError::InvalidValue);
        }

        // the cluster must be fully formed before any write proceeds
        self.ring.wait_full().await;
        let _write = self.write_lock.lock().await;

        let op = if is_put {
            Message::PutReq {
                key: key.into(),
                value: value.unwrap().into(),
            }
        } else {
            Message::DelReq { key: key.into() }
        };

        // phase 1: solicit votes from both replicas; each failure mode of a
        // call (abort reply, timeout, connect failure) is an abort vote, but
        // never skips contacting the other replica
        let mut abort = false;
        let mut vote_error: Option<TandemError> = None;
        let (primary, secondary) = self.replicas_for(key)?;
        for replica in [&primary, &secondary] {
            match self.call_participant(replica, &op).await {
                Ok(Message::Ready) => {
                    pf_debug!("m"; "participant {} voted ready", replica.id);
                }
                Ok(Message::Abort { error }) => {
                    pf_debug!("m"; "participant {} voted abort", replica.id);
                    abort = true;
                    if vote_error.is_none() {
                        vote_error = error;
                    }
                }
                Ok(reply) => {
                    pf_warn!("m"; "unexpected vote from {}: {:?}",
                                  replica.id, reply);
                    abort = true;
                }
                Err(e) => {
                    pf_warn!("m"; "phase 1 call to {} failed: {}",
                                  replica.id, e);
                    abort = true;
                }
            }
        }

        // phase 2: the decision must reach both replicas, however long that
        // takes; an undecided participant must never be left behind
        let decision = if abort {
            Message::Abort { error: None }
        } else {
            Message::Commit
        };
        self.deliver_decision(key, false, &decision).await?;
        self.deliver_decision(key, true, &decision).await?;

        if abort {
            Err(vote_error.unwrap_or(TandemError::InvalidFormat))
        } else {
            // keep the master cache consistent with participant storage
            let mut set = self.cache.lock_for(key);
            if is_put {
                set.put(key, value.unwrap());
            } else {
                set.delete(key);
            }
            Ok(())
        }
    }

    /// Reads a key: master cache first, then the primary replica, then the
    /// secondary; replica answers populate the cache.
    pub async fn handle_read(
        &self,
        key: &str,
    ) -> Result<String, TandemError> {
        self.ring.wait_full().await;

        if let Some(value) = self.cache.lock_for(key).get(key) {
            return Ok(value);
        }

        let (primary, secondary) = self.replicas_for(key)?;
        for replica in [primary, secondary] {
            let req = Message::GetReq { key: key.into() };
            match self.call_participant(&replica, &req).await {
                Ok(Message::Resp {
                    value: Some(value),
                    error: None,
                }) => {
                    self.cache.lock_for(key).put(key, &value);
                    return Ok(value);
                }
                Ok(reply) => {
                    pf_debug!("m"; "read miss at {}: {:?}", replica.id, reply);
                }
                Err(e) => {
                    pf_warn!("m"; "read call to {} failed: {}", replica.id, e);
                }
            }
        }

        Err(TandemError::NoSuchKey)
    }

    /// Resolves the current primary and secondary replica for `key`.
    fn replicas_for(
        &self,
        key: &str,
    ) -> Result<(ParticipantInfo, ParticipantInfo), TandemError> {
        let primary = self
            .ring
            .find_primary(key)
            .ok_or_else(|| TandemError::msg("replica ring is empty"))?;
        let secondary = self
            .ring
            .find_secondary(&primary)
            .ok_or_else(|| TandemError::msg("replica ring is empty"))?;
        Ok((primary, secondary))
    }

    /// One request-reply exchange with a participant, each direction bounded
    /// by the fixed timeout.
    async fn call_participant(
        &self,
        info: &ParticipantInfo,
        req: &Message,
    ) -> Result<Message, TandemError> {
        let mut conn = connect_with_timeout(info.addr(), self.timeout).await?;
        send_msg(&mut conn, req).await?;
        recv_msg_timeout(&mut conn, self.timeout).await
    }

    /// Delivers a phase-2 decision to one replica role, retrying with a
    /// fixed backoff until that participant acks. The replica is re-resolved
    /// on every retry, in case ring membership changed in between.
    async fn deliver_decision(
        &self,
        key: &str,
        to_secondary: bool,
        decision: &Message,
    ) -> Result<(), TandemError> {
        loop {
            let (primary, secondary) = self.replicas_for(key)?;
            let target = if to_secondary { secondary } else { primary };
            match self.call_participant(&target, decision).await {
                Ok(Message::Ack) => return Ok(()),
                Ok(reply) => {
                    pf_warn!("m"; "unexpected decision reply from {}: {:?}",
                                  target.id, reply);
                }
                Err(e) => {
                    pf_warn!("m"; "phase 2 call to {} failed: {}",
                                  target.id, e);
                }
            }
            time::sleep(self.timeout).await;
        }
    }
}
