//! Fault injection at the packet level: corruption, duplication,
//! out-of-order acknowledgements, and silence.

use std::time::Duration;

use crate::infra::*;

use bytes::Bytes;
use ferry_core::identity::{file_id_from_digest, sha256_bytes};
use ferry_core::wire::{FLAG_EOF, FLAG_META_JSON, HEADER_LEN};
use ferry_core::{Packet, PacketKind, TransferOffer};
use ferry_transfer::{SendError, SenderConfig};

const CHUNK: u32 = 1024;

fn offer_for(content: &[u8], name: &str) -> (TransferOffer, u64) {
    let digest = sha256_bytes(content);
    let file_id = file_id_from_digest(&digest).unwrap();
    (
        TransferOffer {
            filename: name.into(),
            filesize: content.len() as u64,
            chunk_size: CHUNK,
            sha256: digest,
        },
        file_id,
    )
}

fn data_chunk(content: &[u8], file_id: u64, chunk_id: u32, total: u32) -> Packet {
    let start = (chunk_id * CHUNK) as usize;
    let end = (start + CHUNK as usize).min(content.len());
    let flags = if chunk_id + 1 == total { FLAG_EOF } else { 0 };
    Packet::data(file_id, chunk_id, flags, Bytes::copy_from_slice(&content[start..end]))
}

#[tokio::test]
async fn corrupted_chunk_is_rejected_without_progress() {
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;
    let client = RawClient::connect(receiver.addr).await;

    let content = random_bytes(1500);
    let (offer, file_id) = offer_for(&content, "bitflip.bin");

    client
        .send_pkt(&Packet::syn(file_id, FLAG_META_JSON, offer.to_payload().unwrap()))
        .await;
    assert_eq!(client.recv_pkt().await.kind, PacketKind::SynAck);

    // Flip one payload bit after encoding; the CRC must catch it.
    let mut mangled = data_chunk(&content, file_id, 0, 2)
        .encode()
        .unwrap()
        .to_vec();
    mangled[HEADER_LEN + 100] ^= 0x01;
    client.send_raw(&mangled).await;

    let reply = client.recv_pkt().await;
    assert_eq!(reply.kind, PacketKind::Err);
    assert_eq!(
        receiver.sessions.get(&file_id).unwrap().next_chunk,
        0,
        "a corrupt chunk must not advance the session"
    );

    // The clean retransmission completes the transfer.
    client.send_pkt(&data_chunk(&content, file_id, 0, 2)).await;
    assert_eq!(client.recv_pkt().await.ack, 0);
    client.send_pkt(&data_chunk(&content, file_id, 1, 2)).await;
    assert_eq!(client.recv_pkt().await.ack, 1);

    // FIN-ACK arrives only after the finalization attempt, so the file is
    // in place once it lands.
    client.send_pkt(&Packet::fin(file_id, 2)).await;
    assert_eq!(client.recv_pkt().await.kind, PacketKind::FinAck);

    assert_eq!(
        std::fs::read(receiver.delivered_path("bitflip.bin")).unwrap(),
        content
    );

    receiver.stop().await;
}

#[tokio::test]
async fn duplicate_chunk_is_reacked_but_never_rewritten() {
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;
    let client = RawClient::connect(receiver.addr).await;

    let content = random_bytes(3 * 1024);
    let (offer, file_id) = offer_for(&content, "dup.bin");

    client
        .send_pkt(&Packet::syn(file_id, FLAG_META_JSON, offer.to_payload().unwrap()))
        .await;
    client.recv_pkt().await;

    client.send_pkt(&data_chunk(&content, file_id, 0, 3)).await;
    assert_eq!(client.recv_pkt().await.ack, 0);

    // Re-inject the delivered chunk: same ACK back, no second write.
    client.send_pkt(&data_chunk(&content, file_id, 0, 3)).await;
    let reack = client.recv_pkt().await;
    assert_eq!(reack.kind, PacketKind::Ack);
    assert_eq!(reack.ack, 0);
    assert_eq!(
        std::fs::metadata(receiver.delivered_path("dup.bin.part"))
            .unwrap()
            .len(),
        1024,
        "the partial file must stay a strict prefix"
    );

    client.send_pkt(&data_chunk(&content, file_id, 1, 3)).await;
    assert_eq!(client.recv_pkt().await.ack, 1);
    client.send_pkt(&data_chunk(&content, file_id, 2, 3)).await;
    assert_eq!(client.recv_pkt().await.ack, 2);

    client.send_pkt(&Packet::fin(file_id, 3)).await;
    assert_eq!(client.recv_pkt().await.kind, PacketKind::FinAck);
    assert_eq!(
        std::fs::read(receiver.delivered_path("dup.bin")).unwrap(),
        content
    );

    receiver.stop().await;
}

#[tokio::test]
async fn data_without_a_session_is_ignored() {
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;
    let client = RawClient::connect(receiver.addr).await;

    let content = random_bytes(512);
    client
        .send_pkt(&Packet::data(0xDEFA_CED0_F11E_D00D, 0, FLAG_EOF, Bytes::from(content)))
        .await;

    assert!(
        client.silent_for(Duration::from_millis(300)).await,
        "unsolicited DATA must draw no reply"
    );

    receiver.stop().await;
}

#[tokio::test]
async fn duplicate_syn_reemits_the_handshake_reply() {
    use ferry_core::wire::{FLAG_RESUME, FLAG_RESUME_OK};
    use ferry_core::OfferReply;

    let out_dir = tempfile::tempdir().unwrap();
    let receiver = TestReceiver::start(out_dir.path()).await;
    let client = RawClient::connect(receiver.addr).await;

    let content = random_bytes(2 * 1024);
    let (offer, file_id) = offer_for(&content, "resyn.bin");
    let syn = Packet::syn(
        file_id,
        FLAG_META_JSON | FLAG_RESUME,
        offer.to_payload().unwrap(),
    );

    client.send_pkt(&syn).await;
    let first = client.recv_pkt().await;
    assert_eq!(OfferReply::from_payload(&first.payload).unwrap().next_chunk, 0);

    client.send_pkt(&data_chunk(&content, file_id, 0, 2)).await;
    assert_eq!(client.recv_pkt().await.ack, 0);

    // A late duplicate of the SYN: answered again, session not reset.
    client.send_pkt(&syn).await;
    let second = client.recv_pkt().await;
    assert_eq!(second.kind, PacketKind::SynAck);
    assert!(second.has_flag(FLAG_RESUME_OK));
    assert_eq!(
        OfferReply::from_payload(&second.payload).unwrap().next_chunk,
        1,
        "the re-emitted reply reflects current progress"
    );
    assert_eq!(receiver.sessions.len(), 1, "no duplicated session");

    client.send_pkt(&data_chunk(&content, file_id, 1, 2)).await;
    assert_eq!(client.recv_pkt().await.ack, 1);

    client.send_pkt(&Packet::fin(file_id, 2)).await;
    assert_eq!(client.recv_pkt().await.kind, PacketKind::FinAck);
    assert_eq!(
        std::fs::read(receiver.delivered_path("resyn.bin")).unwrap(),
        content
    );

    receiver.stop().await;
}

#[tokio::test]
async fn sender_discards_stale_and_foreign_replies() {
    // A scripted "receiver" that answers the first DATA with garbage
    // before the real ACK. The sender must ride it out without a single
    // retransmission.
    let src_dir = tempfile::tempdir().unwrap();
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fake_addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let Ok((len, from)) = sock.recv_from(&mut buf).await else {
                return;
            };
            let Ok(pkt) = Packet::decode(&buf[..len]) else {
                continue;
            };
            match pkt.kind {
                PacketKind::Syn => {
                    let reply = ferry_core::OfferReply {
                        next_chunk: 0,
                        message: String::new(),
                    };
                    let syn_ack =
                        Packet::syn_ack(pkt.file_id, FLAG_META_JSON, reply.to_payload().unwrap());
                    sock.send_to(&syn_ack.encode().unwrap(), from).await.unwrap();
                }
                PacketKind::Data => {
                    // Stale ack, wrong type, then the real thing.
                    let stale = Packet::ack(pkt.file_id, pkt.chunk_id.wrapping_add(7));
                    sock.send_to(&stale.encode().unwrap(), from).await.unwrap();
                    let noise = Packet::err(pkt.file_id, Bytes::from_static(b"noise"));
                    sock.send_to(&noise.encode().unwrap(), from).await.unwrap();
                    let real = Packet::ack(pkt.file_id, pkt.chunk_id);
                    sock.send_to(&real.encode().unwrap(), from).await.unwrap();
                }
                PacketKind::Fin => {
                    let fin_ack = Packet::fin_ack(pkt.file_id, pkt.seq);
                    sock.send_to(&fin_ack.encode().unwrap(), from).await.unwrap();
                    return;
                }
                _ => {}
            }
        }
    });

    let source = write_source(src_dir.path(), "noisy.bin", &random_bytes(600));
    let report = send_file(fake_addr, &source, SenderConfig::default())
        .await
        .unwrap();

    assert_eq!(report.chunks_sent, 1);
    assert_eq!(
        report.retransmissions, 0,
        "stale replies must not trigger a timeout path"
    );
    assert!(report.fin_acked);
}

#[tokio::test]
async fn silence_exhausts_the_retry_budget() {
    // A bound socket that never answers.
    let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_addr = sink.local_addr().unwrap();

    let src_dir = tempfile::tempdir().unwrap();
    let source = write_source(src_dir.path(), "void.bin", &random_bytes(256));

    let cfg = SenderConfig {
        rto_init: Duration::from_millis(40),
        rto_min: Duration::from_millis(20),
        rto_max: Duration::from_millis(80),
        max_retries: 3,
        ..SenderConfig::default()
    };
    let err = send_file(sink_addr, &source, cfg).await.unwrap_err();

    match err {
        SendError::RetryExhausted { expected, retries } => {
            assert_eq!(expected, "SYN-ACK");
            assert_eq!(retries, 3);
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
}
