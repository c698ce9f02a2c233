// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error kinds returned by the library. Only `Resource` is expected to be
// transient; callers retry it after draining completions. Everything else
// indicates a caller or fabric problem.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An API entry point was called before `init` succeeded.
    #[error("runtime not initialized")]
    NoInit,

    /// Bad argument or unknown request id.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// An address range was not found in the buffer registry.
    #[error("address not registered: 0x{addr:016x} + {size}")]
    Lookup { addr: u64, size: u64 },

    /// A ledger or eager buffer is full. The caller should drain
    /// completions and retry.
    #[error("ring resources exhausted: {0}")]
    Resource(&'static str),

    /// The backend reported a completion or submission error.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An optional feature was disabled at configuration time.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller can retry after making progress elsewhere.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Resource(_))
    }
}
