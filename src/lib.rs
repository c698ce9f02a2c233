// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One-sided, zero-copy, completion-notified message passing over
// RDMA-capable fabrics. Ranks register memory once, exchange keys once,
// and signal every completion through in-memory ledger rings instead of
// a per-message wire protocol; small messages bypass the handshake
// through pre-registered eager byte rings.

pub mod spin_lock;
pub use spin_lock::SpinLock;

mod error;
pub use error::{Error, Result};

pub mod rid;
pub use rid::{Rid, NULL_COOKIE};

pub mod config;
pub use config::{BackendKind, Caps, Config, MetaExchange};

pub mod buffer;
pub use buffer::{Buffer, BufferDesc, BufferPriv};

pub mod ledger;
pub mod info_ledger;
pub mod eager;
pub mod storage;
pub mod peer;

pub mod request;
pub use request::{OpFlags, RequestFlags};

pub mod exchange;

pub mod backend;
pub use backend::{EventPoll, Transport};

mod runtime;
pub use runtime::{global, init_global, register_buffer, Runtime};

mod handshake;
pub use handshake::ANY_SIZE;

mod pwc;
pub use pwc::ProbeFlags;

mod event;
pub use event::{LedgerKind, ProbeInfo, Status, TestResult};
