// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The process-wide runtime mirror: registrations requested before init
// are queued and replayed once the runtime comes up. Kept in its own
// test binary because the global instance is process-lifetime state.

mod common;

use common::{ExchangeBoard, Region};
use librma::Config;

#[test]
fn pre_init_registrations_are_replayed() {
    let buf = Region::zeroed(1024);

    // queued: no runtime exists yet
    librma::register_buffer(buf.addr(), buf.len()).unwrap();

    let board = ExchangeBoard::new(1);
    let cfg = Config::new(1, 0, board.meta_for(0));
    let rt = librma::init_global(cfg).unwrap();

    // the queued range is now registered and findable
    assert!(rt.get_buffer_private(buf.addr(), buf.len()).is_ok());
    assert!(librma::global().is_ok());

    // post-init calls go straight through
    let other = Region::zeroed(64);
    librma::register_buffer(other.addr(), other.len()).unwrap();
    assert!(rt.get_buffer_private(other.addr(), other.len()).is_ok());
}
