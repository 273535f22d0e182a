//! End-to-end transfers over a clean loopback link.

use crate::infra::*;

use ferry_core::identity::sha256_file;
use ferry_transfer::SenderConfig;

#[tokio::test]
async fn small_file_delivered_in_two_chunks() {
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;

    // 13 bytes repeated 100 times: one full chunk plus a 276-byte tail.
    let content = b"Hello, ferry!".repeat(100);
    assert_eq!(content.len(), 1300);
    let source = write_source(src_dir.path(), "greeting.bin", &content);

    let report = send_file(receiver.addr, &source, SenderConfig::default())
        .await
        .unwrap();

    assert_eq!(report.total_chunks, 2);
    assert_eq!(report.chunks_sent, 2);
    assert_eq!(report.resumed_from, 0);
    assert_eq!(report.retransmissions, 0);
    assert!(report.fin_acked);

    let delivered = receiver.delivered_path("greeting.bin");
    assert_eq!(std::fs::read(&delivered).unwrap(), content);
    assert_eq!(sha256_file(&delivered).unwrap(), sha256_file(&source).unwrap());

    // No session debris after finalization.
    assert!(!receiver.delivered_path("greeting.bin.part").exists());
    assert!(!receiver.delivered_path("greeting.bin.rdtmeta.json").exists());

    receiver.stop().await;
}

#[tokio::test]
async fn zero_byte_file_still_crosses_the_wire() {
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;

    let source = write_source(src_dir.path(), "empty.bin", b"");
    let report = send_file(receiver.addr, &source, SenderConfig::default())
        .await
        .unwrap();

    assert_eq!(report.total_chunks, 1, "one empty EOF chunk");
    assert_eq!(report.chunks_sent, 1);

    let delivered = receiver.delivered_path("empty.bin");
    assert!(delivered.exists());
    assert_eq!(std::fs::metadata(&delivered).unwrap().len(), 0);

    receiver.stop().await;
}

#[tokio::test]
async fn file_ending_exactly_on_a_chunk_boundary() {
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;

    let content = random_bytes(2048);
    let source = write_source(src_dir.path(), "aligned.bin", &content);
    let report = send_file(receiver.addr, &source, SenderConfig::default())
        .await
        .unwrap();

    assert_eq!(report.total_chunks, 2, "the last chunk is full-sized");
    assert_eq!(
        std::fs::read(receiver.delivered_path("aligned.bin")).unwrap(),
        content
    );

    receiver.stop().await;
}

#[tokio::test]
async fn file_one_byte_past_a_chunk_boundary() {
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;

    let content = random_bytes(2049);
    let source = write_source(src_dir.path(), "ragged.bin", &content);
    let report = send_file(receiver.addr, &source, SenderConfig::default())
        .await
        .unwrap();

    assert_eq!(report.total_chunks, 3, "a one-byte tail chunk");
    assert_eq!(
        std::fs::read(receiver.delivered_path("ragged.bin")).unwrap(),
        content
    );

    receiver.stop().await;
}

#[tokio::test]
async fn colliding_filename_preserves_the_earlier_delivery() {
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;

    let first = random_bytes(1500);
    let second = random_bytes(900);
    assert_ne!(first, second);

    let source = write_source(src_dir.path(), "data.bin", &first);
    send_file(receiver.addr, &source, SenderConfig::default())
        .await
        .unwrap();

    // Same name, different content, different session identity.
    let source = write_source(src_dir.path(), "data.bin", &second);
    send_file(receiver.addr, &source, SenderConfig::default())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(receiver.delivered_path("data.bin")).unwrap(),
        second,
        "the new delivery takes the canonical name"
    );
    let backup = find_backup(out_dir.path(), "data.bin")
        .expect("the first delivery should survive under a backup name");
    assert_eq!(std::fs::read(backup).unwrap(), first);

    receiver.stop().await;
}
