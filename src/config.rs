// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Runtime configuration. One struct handed to `Runtime::init`, covering the
// process set, the fabric backend selection, the bootstrap exchange, and
// the capacity knobs that size the shared-storage rings.

use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Defaults and hard caps
// ---------------------------------------------------------------------------

/// Default number of entries per ledger ring.
pub const DEF_LEDGER_ENTRIES: u32 = 512;
/// Default eager-path threshold for two-sided sends.
pub const DEF_SMALL_MSG_SIZE: u32 = 1024;
/// Default eager-path threshold for put-with-completion.
pub const DEF_SMALL_PWC_SIZE: u32 = 128;
/// Default eager byte-ring size per peer.
pub const DEF_EAGER_BUF_SIZE: u32 = 64 * 1024;
/// Pre-allocated request descriptors per peer (power of two).
pub const DEF_NUM_REQUESTS: u32 = 1024;
/// Upper bound on request descriptors per peer.
pub const MAX_NUM_REQUESTS: u32 = 1 << 20;

// ---------------------------------------------------------------------------
// Backend and exchange selection
// ---------------------------------------------------------------------------

/// Which fabric backend to drive.
///
/// `Verbs`, `Ugni` and `Fi` name out-of-crate `Transport` implementations
/// and are resolved by `Runtime::init_with`. `Mem` is the in-process
/// loopback transport shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Verbs,
    Ugni,
    Fi,
    Mem,
}

/// Allgather callback: gathers `src` from every rank into `dst`
/// (`dst.len() == nproc * src.len()`, rank order).
pub type AllgatherFn =
    dyn Fn(&[u8], &mut [u8]) -> std::result::Result<(), String> + Send + Sync;
/// Barrier callback: returns once every rank has entered.
pub type BarrierFn = dyn Fn() -> std::result::Result<(), String> + Send + Sync;

/// Out-of-band bootstrap transport, used only during `init` for one
/// allgather of the shared-storage descriptors and one barrier.
#[derive(Clone)]
pub enum MetaExchange {
    /// MPI_Allgather / MPI_Barrier. Needs an MPI-aware integration layer.
    Mpi,
    /// Cray PMI. Needs a PMI-aware integration layer.
    Pmi,
    /// Session-layer (XSP) exchange through a forwarder.
    Xsp,
    /// User-supplied callback pair.
    External {
        allgather: Arc<AllgatherFn>,
        barrier: Arc<BarrierFn>,
    },
}

impl fmt::Debug for MetaExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaExchange::Mpi => f.write_str("Mpi"),
            MetaExchange::Pmi => f.write_str("Pmi"),
            MetaExchange::Xsp => f.write_str("Xsp"),
            MetaExchange::External { .. } => f.write_str("External"),
        }
    }
}

// ---------------------------------------------------------------------------
// Capacity knobs
// ---------------------------------------------------------------------------

/// Ring and threshold sizing. All ring capacities are rounded up to powers
/// of two by [`Config::normalize`].
#[derive(Debug, Clone, Copy)]
pub struct Caps {
    /// Completion queues the backend should create.
    pub num_cq: u8,
    /// Whether the backend exposes a remote completion queue
    /// (`get_revent`).
    pub use_rcq: bool,
    /// Entries per ledger ring (power of two).
    pub ledger_entries: u32,
    /// Eager threshold for `post_send_buffer`.
    pub small_msg_size: u32,
    /// Eager threshold for `put_with_completion`.
    pub small_pwc_size: u32,
    /// Per-peer eager byte-ring size (power of two).
    pub eager_buf_size: u32,
}

impl Default for Caps {
    fn default() -> Self {
        Self {
            num_cq: 1,
            use_rcq: false,
            ledger_entries: DEF_LEDGER_ENTRIES,
            small_msg_size: DEF_SMALL_MSG_SIZE,
            small_pwc_size: DEF_SMALL_PWC_SIZE,
            eager_buf_size: DEF_EAGER_BUF_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend-specific sub-structs
// ---------------------------------------------------------------------------

/// InfiniBand Verbs knobs.
#[derive(Debug, Clone, Default)]
pub struct VerbsConfig {
    pub use_ud: bool,
    pub use_cma: bool,
    pub ib_dev: Option<String>,
    pub ib_port: Option<u8>,
    pub eth_dev: Option<String>,
    pub ud_gid_prefix: Option<String>,
}

/// Cray uGNI knobs.
#[derive(Debug, Clone, Default)]
pub struct UgniConfig {
    /// Block-transfer-engine threshold in bytes.
    pub bte_thresh: Option<u32>,
    pub eth_dev: Option<String>,
}

/// libfabric knobs.
#[derive(Debug, Clone, Default)]
pub struct FiConfig {
    pub provider: Option<String>,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of ranks in the fixed peer set.
    pub nproc: u32,
    /// This process's rank.
    pub rank: u32,
    /// Additional forwarder endpoints appended after the rank set.
    pub forwarders: u32,
    pub backend: BackendKind,
    pub meta_exch: MetaExchange,
    pub cap: Caps,
    pub verbs: VerbsConfig,
    pub ugni: UgniConfig,
    pub fi: FiConfig,
}

impl Config {
    /// A minimal configuration for `nproc` ranks on the in-process
    /// loopback transport. Callers still have to supply an exchange.
    pub fn new(nproc: u32, rank: u32, meta_exch: MetaExchange) -> Self {
        Self {
            nproc,
            rank,
            forwarders: 0,
            backend: BackendKind::Mem,
            meta_exch,
            cap: Caps::default(),
            verbs: VerbsConfig::default(),
            ugni: UgniConfig::default(),
            fi: FiConfig::default(),
        }
    }

    /// Total endpoint count: ranks plus forwarders.
    pub fn total_proc(&self) -> usize {
        (self.nproc + self.forwarders) as usize
    }

    /// Round ring capacities up to powers of two and clamp against the
    /// hard caps. Called once at the top of `init`.
    pub fn normalize(&mut self) {
        self.cap.ledger_entries = roundup_pow2(self.cap.ledger_entries.max(1));
        self.cap.eager_buf_size = roundup_pow2(self.cap.eager_buf_size.max(1));
        if self.cap.small_pwc_size > self.cap.eager_buf_size {
            self.cap.small_pwc_size = self.cap.eager_buf_size;
        }
        // packed-message headers carry a 16-bit length
        self.cap.small_pwc_size = self.cap.small_pwc_size.min(u16::MAX as u32);
    }

    /// Basic sanity checks; invalid combinations are caller errors.
    pub fn validate(&self) -> crate::Result<()> {
        if self.nproc == 0 {
            return Err(crate::Error::Invalid("nproc must be nonzero".into()));
        }
        if self.rank >= self.nproc {
            return Err(crate::Error::Invalid(format!(
                "rank {} out of range for nproc {}",
                self.rank, self.nproc
            )));
        }
        Ok(())
    }
}

/// Smallest power of two >= `v`.
pub(crate) fn roundup_pow2(v: u32) -> u32 {
    v.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_exchange() -> MetaExchange {
        MetaExchange::External {
            allgather: Arc::new(|_s, _d| Ok(())),
            barrier: Arc::new(|| Ok(())),
        }
    }

    #[test]
    fn normalize_rounds_to_pow2() {
        let mut cfg = Config::new(2, 0, noop_exchange());
        cfg.cap.ledger_entries = 300;
        cfg.cap.eager_buf_size = 100_000;
        cfg.normalize();
        assert_eq!(cfg.cap.ledger_entries, 512);
        assert_eq!(cfg.cap.eager_buf_size, 131_072);
    }

    #[test]
    fn validate_rejects_bad_rank() {
        let cfg = Config::new(2, 2, noop_exchange());
        assert!(cfg.validate().is_err());
    }
}
