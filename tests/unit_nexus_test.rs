use ahad::core::errors::AhaError;
use ahad::core::nexus::{NexusApplier, NexusEdit, NexusEntry, NexusRoot, WalFsync};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct CountingApplier {
    applied: AtomicU64,
}

impl NexusApplier for CountingApplier {
    fn apply(&self, _indx: u64, _edit: &NexusEdit) {
        self.applied.fetch_add(1, Ordering::SeqCst);
    }
}

fn edit(iden: &str) -> NexusEdit {
    NexusEdit::ProvDel {
        iden: iden.to_string(),
    }
}

#[tokio::test]
async fn test_nexus_issue_assigns_offsets() {
    let dirn = tempfile::tempdir().unwrap();
    let path = dirn.path().join("nexus.log");
    let (nexus, recs) = NexusRoot::open(&path, WalFsync::Always, false).await.unwrap();
    assert!(recs.is_empty());

    let applier = CountingApplier::default();
    assert_eq!(nexus.issue(edit("a"), &applier).await.unwrap(), 0);
    assert_eq!(nexus.issue(edit("b"), &applier).await.unwrap(), 1);
    assert_eq!(nexus.issue(edit("c"), &applier).await.unwrap(), 2);

    assert_eq!(nexus.current_indx(), 3);
    assert_eq!(applier.applied.load(Ordering::SeqCst), 3);

    nexus.wait_offs(3, Duration::from_millis(100)).await.unwrap();
    let err = nexus
        .wait_offs(4, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, AhaError::Timeout(_)));
}

#[tokio::test]
async fn test_nexus_records_survive_reopen() {
    let dirn = tempfile::tempdir().unwrap();
    let path = dirn.path().join("nexus.log");

    {
        let (nexus, _) = NexusRoot::open(&path, WalFsync::Always, false).await.unwrap();
        let applier = CountingApplier::default();
        nexus.issue(edit("a"), &applier).await.unwrap();
        nexus.issue(edit("b"), &applier).await.unwrap();
    }

    let (_nexus, recs) = NexusRoot::open(&path, WalFsync::Always, false).await.unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[1].indx, 1);
}

#[tokio::test]
async fn test_follower_rejects_writes_and_applies_in_order() {
    let dirn = tempfile::tempdir().unwrap();
    let path = dirn.path().join("nexus.log");
    let (nexus, _) = NexusRoot::open(&path, WalFsync::Always, true).await.unwrap();
    let applier = CountingApplier::default();

    let err = nexus.issue(edit("a"), &applier).await.unwrap_err();
    assert!(matches!(err, AhaError::NotReady(_)));

    let entry0 = NexusEntry {
        indx: 0,
        edit: edit("a"),
    };
    let entry2 = NexusEntry {
        indx: 2,
        edit: edit("c"),
    };

    nexus.apply_entry(&entry0, &applier).await.unwrap();
    // Replayed overlap is a silent no-op.
    nexus.apply_entry(&entry0, &applier).await.unwrap();
    assert_eq!(applier.applied.load(Ordering::SeqCst), 1);

    // A gap means this follower needs a snapshot resync.
    let err = nexus.apply_entry(&entry2, &applier).await.unwrap_err();
    assert!(matches!(err, AhaError::BadStorageVersion(_)));
}

#[tokio::test]
async fn test_read_entries_from_offset() {
    let dirn = tempfile::tempdir().unwrap();
    let path = dirn.path().join("nexus.log");
    let (nexus, _) = NexusRoot::open(&path, WalFsync::Always, false).await.unwrap();
    let applier = CountingApplier::default();

    for iden in ["a", "b", "c", "d"] {
        nexus.issue(edit(iden), &applier).await.unwrap();
    }

    let entries = nexus.read_entries(2).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].indx, 2);
    assert_eq!(entries[0].edit, edit("c"));
}
