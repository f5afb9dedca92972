//! Restart behavior: open and prepared transactions survive a reopen of the
//! underlying store.

use mvtx_core::{
    FileBackend, InMemoryBackend, MvStore, StorageBackend, StoreConfig, TransactionStatus,
    TransactionStore,
};
use std::sync::Arc;

fn open(backend: Box<dyn StorageBackend>) -> Arc<TransactionStore> {
    let store = MvStore::open(backend, StoreConfig::default()).unwrap();
    let ts = TransactionStore::new(Arc::new(store)).unwrap();
    ts.init().unwrap();
    ts
}

fn s(text: &str) -> String {
    text.to_string()
}

fn two_phase_commit_sessions(mut reopen: impl FnMut() -> Box<dyn StorageBackend>) {
    // session 1: leave a named transaction open
    {
        let ts = open(reopen());
        let tx = ts.begin().unwrap();
        assert_eq!(tx.id().as_u32(), 1);
        tx.set_name("first transaction").unwrap();
        let m = tx.open_map::<String, String>("test").unwrap();
        m.put(s("1"), s("Hello")).unwrap();
        ts.store().commit().unwrap();
    }

    // session 2: the open transaction is recovered and gets prepared
    {
        let ts = open(reopen());
        let tx = ts.begin().unwrap();
        assert_eq!(tx.id().as_u32(), 2);
        let m = tx.open_map::<String, String>("test").unwrap();
        assert_eq!(m.get(&s("1")).unwrap(), None);
        m.put(s("2"), s("World")).unwrap();

        let open = ts.get_open_transactions();
        assert_eq!(open.len(), 2);
        let first = &open[0];
        assert_eq!(first.id().as_u32(), 1);
        assert_eq!(first.status(), TransactionStatus::Open);
        assert_eq!(first.name().as_deref(), Some("first transaction"));
        assert_eq!(open[1].id().as_u32(), 2);
        assert_eq!(open[1].name(), None);

        first.prepare().unwrap();
        tx.commit().unwrap();
        ts.store().commit().unwrap();
    }

    // session 3: the prepared transaction is finished
    {
        let ts = open(reopen());
        let tx = ts.begin().unwrap();
        assert_eq!(tx.id().as_u32(), 2);
        let m = tx.open_map::<String, String>("test").unwrap();
        assert_eq!(m.get(&s("1")).unwrap(), None);
        assert_eq!(m.get(&s("2")).unwrap(), Some(s("World")));
        m.put(s("3"), s("!")).unwrap();

        let open = ts.get_open_transactions();
        assert_eq!(open.len(), 2);
        let first = &open[0];
        assert_eq!(first.id().as_u32(), 1);
        assert_eq!(first.status(), TransactionStatus::Prepared);
        assert_eq!(first.name().as_deref(), Some("first transaction"));
        assert_eq!(open[1].status(), TransactionStatus::Open);
        assert_eq!(open[1].name(), None);

        tx.rollback().unwrap();
        first.commit().unwrap();
        assert!(ts.get_open_transactions().is_empty());

        // a finished handle still reads until its id is reused
        assert_eq!(m.get(&s("1")).unwrap(), Some(s("Hello")));
        assert_eq!(m.get(&s("3")).unwrap(), None);
        ts.close().unwrap();
    }

    let ts = open(reopen());
    assert!(ts.get_open_transactions().is_empty());
    let tx = ts.begin().unwrap();
    let m = tx.open_map::<String, String>("test").unwrap();
    let entries: Vec<(String, String)> = m.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(entries, vec![(s("1"), s("Hello")), (s("2"), s("World"))]);
}

#[test]
fn two_phase_commit_in_memory() {
    let backend = InMemoryBackend::new();
    two_phase_commit_sessions(|| -> Box<dyn StorageBackend> { Box::new(backend.clone()) });
}

#[test]
fn two_phase_commit_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store").join("tx.mvtx");
    two_phase_commit_sessions(|| -> Box<dyn StorageBackend> {
        Box::new(FileBackend::open_with_create_dirs(&path).unwrap())
    });
}

#[test]
fn recovered_open_transaction_rolls_back() {
    let backend = InMemoryBackend::new();
    {
        let ts = open(Box::new(backend.clone()));
        let tx = ts.begin().unwrap();
        let m = tx.open_map::<i64, i64>("data").unwrap();
        m.put(1, 10).unwrap();
        m.put(2, 20).unwrap();
        tx.commit().unwrap();

        let tx = ts.begin().unwrap();
        let m = tx.open_map::<i64, i64>("data").unwrap();
        m.put(1, 11).unwrap();
        m.remove(&2).unwrap();
        m.put(3, 30).unwrap();
        ts.store().commit().unwrap();
    }

    let ts = open(Box::new(backend.clone()));
    let open = ts.get_open_transactions();
    assert_eq!(open.len(), 1);
    let pending = &open[0];
    assert_eq!(pending.log_id(), 3);
    let changed: Vec<_> = pending
        .get_changes(0)
        .unwrap()
        .map(|c| c.map_name)
        .collect();
    assert_eq!(changed, vec![s("data"); 3]);

    let reader = ts.begin().unwrap();
    let view = reader.open_map::<i64, i64>("data").unwrap();
    assert_eq!(view.get(&1).unwrap(), Some(10));
    assert_eq!(view.get(&2).unwrap(), Some(20));
    assert_eq!(view.get(&3).unwrap(), None);

    pending.rollback().unwrap();
    assert_eq!(view.get(&1).unwrap(), Some(10));
    assert_eq!(view.get(&2).unwrap(), Some(20));
    assert_eq!(view.size().unwrap(), 2);
}

#[test]
fn finished_transactions_leave_nothing_to_recover() {
    let backend = InMemoryBackend::new();
    {
        let ts = open(Box::new(backend.clone()));
        for i in 0..5 {
            let tx = ts.begin().unwrap();
            tx.open_map::<i64, i64>("data").unwrap().put(i, i).unwrap();
            if i % 2 == 0 {
                tx.commit().unwrap();
            } else {
                tx.rollback().unwrap();
            }
        }
        ts.close().unwrap();
    }

    let ts = open(Box::new(backend));
    assert!(ts.get_open_transactions().is_empty());
    let tx = ts.begin().unwrap();
    let m = tx.open_map::<i64, i64>("data").unwrap();
    let keys: Vec<i64> = m.keys(None).collect::<Result<_, _>>().unwrap();
    assert_eq!(keys, vec![0, 2, 4]);
}

#[test]
fn uncommitted_store_state_is_lost() {
    let backend = InMemoryBackend::new();
    {
        let ts = open(Box::new(backend.clone()));
        let tx = ts.begin().unwrap();
        tx.open_map::<i64, i64>("data").unwrap().put(1, 1).unwrap();
        tx.commit().unwrap();
        // no store commit
    }

    let ts = open(Box::new(backend));
    assert!(!ts.has_map("data"));
    assert!(ts.get_open_transactions().is_empty());
}
