//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod hash;
mod safetcp;

pub use error::TandemError;
pub use hash::hash64;
pub use print::logger_init;
pub use safetcp::bind_with_retry;

pub(crate) use safetcp::{
    connect_with_timeout, recv_msg, recv_msg_timeout, send_msg,
};

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// Longest accepted value, in bytes.
pub const MAX_VALUE_LEN: usize = 256 * 1024;
