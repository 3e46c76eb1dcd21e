// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use vinyl_tree::{
    transaction::{TransactionManager, TxnState, TxnType},
    value::InternalValue,
    Index, SeqNo, ValueType,
};
use test_log::test;

fn value(key: &str, val: &str, seqno: SeqNo) -> InternalValue {
    InternalValue::from_components(key, val, seqno, ValueType::Value)
}

#[test]
fn writer_invalidates_a_concurrent_reader_of_the_same_key() {
    let mgr = TransactionManager::default();
    let index = Index::new();

    let reader = mgr.begin(TxnType::ReadWrite);
    mgr.track_read(&reader, b"k", false);

    let writer = mgr.begin(TxnType::ReadWrite);
    mgr.set_write(&writer, value("k", "from-writer", 0));

    mgr.prepare(&writer).expect("writer has no competing reads");
    mgr.commit(&writer, 1, &index).expect("writer commits");

    // reader's read of "k" was invalidated by writer's commit, so reader's
    // own prepare must now fail.
    assert!(reader.is_aborted());
    let result = mgr.prepare(&reader);
    assert!(result.is_err());

    let range = index.range_for_key(b"k").expect("covering range");
    let mem = range.active_mem().expect("active mem");
    assert_eq!(
        b"from-writer".as_slice(),
        &*mem.get(b"k", SeqNo::MAX).unwrap().value
    );
}

#[test]
fn reader_sees_snapshot_established_at_begin() {
    let mgr = TransactionManager::default();
    let index = Index::new();

    let writer = mgr.begin(TxnType::ReadWrite);
    mgr.set_write(&writer, value("k", "v1", 0));
    mgr.prepare(&writer).expect("no conflict");
    mgr.commit(&writer, 1, &index).expect("commit succeeds");

    let reader = mgr.begin(TxnType::ReadOnly);
    assert_eq!(Some(1), reader.vlsn());

    let writer2 = mgr.begin(TxnType::ReadWrite);
    mgr.set_write(&writer2, value("k", "v2", 1));
    mgr.prepare(&writer2).expect("no conflict");
    mgr.commit(&writer2, 2, &index).expect("commit succeeds");

    // The reader's vlsn was fixed before writer2 committed.
    assert_eq!(Some(1), reader.vlsn());
    assert_eq!(TxnState::Ready, reader.state());
}

#[test]
fn rollback_leaves_no_trace_in_the_index() {
    let mgr = TransactionManager::default();
    let index = Index::new();

    let txn = mgr.begin(TxnType::ReadWrite);
    mgr.set_write(&txn, value("k", "v", 0));
    mgr.rollback(&txn);

    assert_eq!(TxnState::RolledBack, txn.state());
    assert_eq!(0, mgr.lsn());
}
