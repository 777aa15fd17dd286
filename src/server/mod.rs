//! Participant-side functionality modules.

mod storage;
mod kv;
mod wal;
mod participant;

pub use storage::KvStore;
pub use kv::KvServer;
pub use wal::{WalEntry, WalLog};
pub use participant::{ServerConfig, TxnParticipant, TxnPhase};
