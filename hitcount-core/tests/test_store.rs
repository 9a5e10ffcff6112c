// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{thread, time::Duration};

use assert2::{check, let_assert};
use hitcount_core::{CountStore, FlushRecord, test_util::TestStore};

#[test]
fn records_successes_and_failures_separately() {
    let store = TestStore::default();
    store.fail_key("down");
    let mut handle = store.clone();

    handle.store("up", 2).unwrap();
    let_assert!(Err(err) = handle.store("down", 5));
    check!(err.to_string() == "refusing to store down");
    handle.store("up", 3).unwrap();

    check!(store.records() == vec![FlushRecord::new("up", 2), FlushRecord::new("up", 3)]);
    check!(store.sums()["up"] == 5);
    check!(store.failures() == 1);
    check!(store.calls() == 3);
    check!(!store.saw_overlapping_calls());
}

#[test]
fn detects_overlapping_calls() {
    let store = TestStore::default();
    store.set_delay(Duration::from_millis(50));
    thread::scope(|scope| {
        for i in 0..2 {
            let mut handle = store.clone();
            scope.spawn(move || handle.store("k", i + 1).unwrap());
        }
    });
    check!(store.saw_overlapping_calls());
    check!(store.wait_for_calls(2, Duration::ZERO));
}
