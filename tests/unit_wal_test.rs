use ahad::core::nexus::{Wal, WalFsync, WalRecord};

fn rec(indx: u64, text: &str) -> WalRecord {
    WalRecord {
        indx,
        edit: text.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn test_wal_append_and_load() {
    let dirn = tempfile::tempdir().unwrap();
    let path = dirn.path().join("nexus.log");

    let mut wal = Wal::open(&path, WalFsync::Always).await.unwrap();
    for indx in 0..3u64 {
        wal.append(&rec(indx, "edit")).await.unwrap();
    }
    drop(wal);

    let recs = Wal::load(&path).await.unwrap();
    assert_eq!(recs.len(), 3);
    assert_eq!(recs[2].indx, 2);
    assert_eq!(recs[0].edit, b"edit".to_vec());
}

#[tokio::test]
async fn test_wal_truncates_torn_tail() {
    let dirn = tempfile::tempdir().unwrap();
    let path = dirn.path().join("nexus.log");

    let mut wal = Wal::open(&path, WalFsync::Always).await.unwrap();
    wal.append(&rec(0, "good")).await.unwrap();
    wal.append(&rec(1, "good")).await.unwrap();
    drop(wal);

    // Simulate a crash mid-append: garbage on the tail.
    let good_len = std::fs::metadata(&path).unwrap().len();
    let mut buf = std::fs::read(&path).unwrap();
    buf.extend_from_slice(&[0x07, 0x00, 0x00, 0x00, 0xde, 0xad]);
    std::fs::write(&path, &buf).unwrap();

    let recs = Wal::load(&path).await.unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

    // Loading again after truncation is idempotent.
    let recs = Wal::load(&path).await.unwrap();
    assert_eq!(recs.len(), 2);
}

#[tokio::test]
async fn test_wal_corrupt_record_drops_tail() {
    let dirn = tempfile::tempdir().unwrap();
    let path = dirn.path().join("nexus.log");

    let mut wal = Wal::open(&path, WalFsync::Always).await.unwrap();
    wal.append(&rec(0, "keep")).await.unwrap();
    let keep_len = std::fs::metadata(&path).unwrap().len() as usize;
    wal.append(&rec(1, "mangle")).await.unwrap();
    drop(wal);

    // Flip a payload byte of the second record; its crc no longer holds.
    let mut buf = std::fs::read(&path).unwrap();
    let last = buf.len() - 1;
    buf[last] ^= 0xff;
    std::fs::write(&path, &buf).unwrap();

    let recs = Wal::load(&path).await.unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, keep_len);
}
