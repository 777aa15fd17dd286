//! Tandem is a replicated key-value store: one master node coordinates
//! writes across a ring of participant servers with two-phase commit, while
//! reads are served through a second-chance cache on every node.

#[macro_use]
pub mod utils;

pub mod cache;
pub mod client;
pub mod master;
pub mod server;
pub mod wire;
pub mod workers;

pub use utils::{
    bind_with_retry, logger_init, TandemError, MAX_KEY_LEN, MAX_VALUE_LEN,
};

pub use cache::Cache;
pub use workers::WorkerPool;

pub use wire::{serve, ConnHandler, Message};

pub use server::{
    KvServer, KvStore, ServerConfig, TxnParticipant, TxnPhase, WalEntry,
    WalLog,
};

pub use master::{
    ClientApiHandler, Coordinator, MasterConfig, ParticipantInfo,
    RegistrationHandler, ReplicaRing,
};

pub use client::KvClient;
