use crate::connection::mock::MockLink;
use crate::stream::error::TransferError;
use crate::stream::send::{SenderConfig, SenderEngine, serve_request};
use crate::transport::{self, MAX_CHUNK, MAX_PAYLOAD, MessageType, Packet};
use sha2::{Digest, Sha256};
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

fn source(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

fn engine(len: usize, script: Vec<Option<Vec<u8>>>) -> SenderEngine<Cursor<Vec<u8>>, MockLink> {
    SenderEngine::new(
        Cursor::new(source(len)),
        MockLink::with_script(script),
        SenderConfig::default(),
    )
}

fn ack(seq: u32) -> Option<Vec<u8>> {
    Some(transport::encode(MessageType::Ack, seq, &[]))
}

fn nak(seq: u32) -> Option<Vec<u8>> {
    Some(transport::encode(MessageType::Nak, seq, &[]))
}

fn data_seqs(packets: &[Packet]) -> Vec<u32> {
    packets
        .iter()
        .filter(|p| p.header.kind == MessageType::Data)
        .map(|p| p.header.seq)
        .collect()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn create_temp_dir() -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "udpfile_send_test_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

mod window_tests {
    use super::*;

    #[test]
    fn start_fills_window_to_capacity() {
        let mut sender = engine(10 * MAX_PAYLOAD, vec![]);
        sender.start().unwrap();

        assert_eq!(sender.in_flight(), 5);
        assert_eq!(sender.next_seq(), 5);
        assert_eq!(data_seqs(&sender.link().sent_packets()), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn start_stops_at_end_of_short_source() {
        let mut sender = engine(3000, vec![]);
        sender.start().unwrap();

        let sent = sender.link().sent_packets();
        let lengths: Vec<usize> = sent.iter().map(|p| p.payload.len()).collect();
        assert_eq!(lengths, vec![1024, 1024, 952]);
        assert_eq!(sender.in_flight(), 3);
    }

    #[test]
    fn ack_slides_window_by_one() {
        let mut sender = engine(10 * MAX_PAYLOAD, vec![]);
        sender.start().unwrap();

        sender.on_ack(2).unwrap();
        assert_eq!(sender.in_flight(), 5);
        assert_eq!(data_seqs(&sender.link().sent_packets()), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn ack_outside_window_is_noop() {
        let mut sender = engine(10 * MAX_PAYLOAD, vec![]);
        sender.start().unwrap();
        sender.on_ack(0).unwrap();
        let sent_before = sender.link().sent.len();

        sender.on_ack(0).unwrap(); // duplicate
        sender.on_ack(42).unwrap(); // never sent
        assert_eq!(sender.link().sent.len(), sent_before);
        assert_eq!(sender.in_flight(), 5);
        assert_eq!(sender.next_seq(), 6);
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let total_chunks = 23u32;
        let mut sender = engine(total_chunks as usize * MAX_PAYLOAD - 100, vec![]);
        sender.start().unwrap();
        assert!(sender.in_flight() <= 5);

        // Acknowledge out of order within the window, plus stray duplicates.
        let mut seq = 0;
        while seq < total_chunks {
            if seq + 1 < sender.next_seq() {
                sender.on_ack(seq + 1).unwrap();
                assert!(sender.in_flight() <= 5);
            }
            sender.on_ack(seq).unwrap();
            sender.on_ack(seq).unwrap();
            assert!(sender.in_flight() <= 5);
            seq += 1;
        }
        assert!(sender.is_complete());
        assert_eq!(sender.next_seq(), total_chunks);
    }
}

mod retransmit_tests {
    use super::*;

    #[test]
    fn nak_resends_identical_datagram() {
        let mut sender = engine(4 * MAX_PAYLOAD, vec![]);
        sender.start().unwrap();
        let original = sender.link().sent[2].clone();

        sender.on_nak(2).unwrap();
        assert_eq!(sender.link().sent.last().unwrap(), &original);
        assert_eq!(sender.in_flight(), 4);
    }

    #[test]
    fn nak_for_acked_seq_is_ignored() {
        let mut sender = engine(4 * MAX_PAYLOAD, vec![]);
        sender.start().unwrap();
        sender.on_ack(1).unwrap();
        let sent_before = sender.link().sent.len();

        sender.on_nak(1).unwrap();
        assert_eq!(sender.link().sent.len(), sent_before);
    }

    #[test]
    fn timeout_resends_every_outstanding_packet() {
        let mut sender = engine(3 * MAX_PAYLOAD, vec![]);
        sender.start().unwrap();
        sender.on_ack(1).unwrap();

        sender.on_timeout().unwrap();
        let sent = sender.link().sent_packets();
        assert_eq!(data_seqs(&sent[3..]), vec![0, 2]);
    }

    #[test]
    fn timeouts_exhaust_budget_with_fin_diagnostic() {
        let mut sender = engine(2 * MAX_PAYLOAD, vec![]);

        let err = sender.run().unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetransmitBudgetExhausted { seq: 0, attempts: 6 }
        ));

        let sent = sender.link().sent_packets();
        // Initial pair plus five full resends, then FIN.
        assert_eq!(data_seqs(&sent).len(), 2 + 5 * 2);
        let fin = sent.last().unwrap();
        assert_eq!(fin.header.kind, MessageType::Fin);
        assert!(fin.payload_text().contains("Retransmit budget exhausted"));
        assert_eq!(sender.link().timeouts_seen, 6);
    }

    #[test]
    fn repeated_naks_exhaust_budget() {
        let mut sender = engine(MAX_PAYLOAD, vec![nak(0); 6]);

        let err = sender.run().unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetransmitBudgetExhausted { seq: 0, .. }
        ));
        let sent = sender.link().sent_packets();
        assert_eq!(data_seqs(&sent), vec![0; 6]);
        assert_eq!(sent.last().unwrap().header.kind, MessageType::Fin);
        assert!(!sent.last().unwrap().payload.is_empty());
        assert_eq!(sender.link().closed_after, Some(sent.len() - 1));
    }

    #[test]
    fn ack_resets_budget() {
        // Four NAKs plus one timeout stay within the budget of five for seq 0.
        let script = vec![nak(0), nak(0), nak(0), nak(0), None, ack(0), nak(1), ack(1)];
        let mut sender = engine(2 * MAX_PAYLOAD, script);

        let summary = sender.run().expect("Transfer should complete");
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.retransmissions, 4 + 2 + 1);
    }
}

mod completion_tests {
    use super::*;

    #[test]
    fn three_thousand_bytes_in_three_chunks() {
        let mut sender = engine(3000, vec![ack(0), ack(1), ack(2)]);
        let summary = sender.run().expect("Transfer should complete");

        let sent = sender.link().sent_packets();
        assert_eq!(sent.len(), 4);
        let lengths: Vec<usize> = sent[..3].iter().map(|p| p.payload.len()).collect();
        assert_eq!(lengths, vec![1024, 1024, 952]);
        assert_eq!(sent[3].header.kind, MessageType::Fin);
        assert!(sent[3].payload.is_empty());

        let rebuilt: Vec<u8> = sent[..3].iter().flat_map(|p| p.payload.clone()).collect();
        assert_eq!(rebuilt, source(3000));
        assert_eq!(
            summary,
            crate::stream::send::TransferSummary {
                chunks: 3,
                bytes: 3000,
                retransmissions: 0,
                digest: sha256(&source(3000)),
            }
        );
    }

    #[test]
    fn exact_multiple_of_chunk_size() {
        let chunks = 7u32;
        let script = (0..chunks).map(ack).collect();
        let mut sender = engine(chunks as usize * MAX_PAYLOAD, script);
        sender.run().expect("Transfer should complete");

        let sent = sender.link().sent_packets();
        assert_eq!(data_seqs(&sent), (0..chunks).collect::<Vec<_>>());
        assert!(sent[..7].iter().all(|p| p.payload.len() == MAX_PAYLOAD));
        assert_eq!(sent.last().unwrap().header.kind, MessageType::Fin);
    }

    #[test]
    fn link_is_closed_right_before_fin() {
        let mut sender = engine(3000, vec![ack(0), ack(1), ack(2)]);
        sender.run().expect("Transfer should complete");

        // Replies to the FIN must not be routed to this session any more.
        assert_eq!(sender.link().closed_after, Some(3));
        assert_eq!(sender.link().sent.len(), 4);
    }

    #[test]
    fn empty_source_sends_fin_immediately() {
        let mut sender = engine(0, vec![]);
        let summary = sender.run().expect("Empty transfer should complete");

        let sent = sender.link().sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.kind, MessageType::Fin);
        assert_eq!(summary.chunks, 0);
        assert_eq!(sender.link().timeouts_seen, 0);
    }

    #[test]
    fn malformed_and_foreign_packets_are_ignored() {
        let script = vec![
            Some(b"short".to_vec()),
            Some(transport::encode(MessageType::Get, 0, b"other.txt")),
            ack(0),
        ];
        let mut sender = engine(100, script);
        sender.run().expect("Transfer should complete");

        let sent = sender.link().sent_packets();
        assert_eq!(data_seqs(&sent), vec![0]);
        assert_eq!(sent.last().unwrap().header.kind, MessageType::Fin);
    }
}

mod serve_request_tests {
    use super::*;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("disk on fire"))
        }
    }

    #[test]
    fn missing_file_sends_single_err() {
        let root = create_temp_dir();
        let mut link = MockLink::default();

        let err = serve_request(&mut link, &root, "absent.bin", SenderConfig::default())
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));

        let sent = link.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.kind, MessageType::Err);
        assert_eq!(sent[0].payload_text(), "File not found");
        assert_eq!(link.closed_after, Some(0));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn escaping_name_is_rejected() {
        let root = create_temp_dir();
        let mut link = MockLink::default();

        let err = serve_request(&mut link, &root, "../secret", SenderConfig::default())
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidFileName(_)));
        assert_eq!(link.sent_packets()[0].header.kind, MessageType::Err);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn existing_file_is_streamed() {
        let root = create_temp_dir();
        std::fs::write(root.join("name.ext"), source(1500)).unwrap();
        let mut link = MockLink::with_script(vec![ack(0), ack(1)]);

        let summary = serve_request(&mut link, &root, "name.ext", SenderConfig::default())
            .expect("Transfer should complete");
        assert_eq!(summary.bytes, 1500);
        assert_eq!(summary.digest, sha256(&source(1500)));

        let sent = link.sent_packets();
        assert_eq!(data_seqs(&sent), vec![0, 1]);
        assert_eq!(sent.last().unwrap().header.kind, MessageType::Fin);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn read_failure_is_fatal() {
        let mut sender = SenderEngine::new(
            FailingReader,
            MockLink::default(),
            SenderConfig::default(),
        );
        let err = sender.run().unwrap_err();
        assert!(matches!(err, TransferError::ReadFailed(_)));
        assert!(sender.link().sent.is_empty());
    }

    #[test]
    fn directory_is_not_found() {
        let root = create_temp_dir();
        std::fs::create_dir_all(root.join("docs")).unwrap();
        let mut link = MockLink::default();

        let err = serve_request(&mut link, &root, "docs", SenderConfig::default()).unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
        assert_eq!(link.sent_packets()[0].payload_text(), "File not found");
        let _ = std::fs::remove_dir_all(root);
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn degenerate_values_are_clamped() {
        let config = SenderConfig {
            window_size: 0,
            chunk_size: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.window_size, 1);
        assert_eq!(config.chunk_size, 1);

        let config = SenderConfig {
            chunk_size: 70_000,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.chunk_size, MAX_CHUNK);
    }

    #[test]
    fn defaults_are_untouched() {
        let config = SenderConfig::default().normalized();
        assert_eq!(config.window_size, 5);
        assert_eq!(config.chunk_size, MAX_PAYLOAD);
    }

    #[test]
    fn oversized_chunks_fit_a_datagram() {
        let config = SenderConfig {
            window_size: 0,
            chunk_size: usize::MAX,
            ..Default::default()
        };
        let mut sender = SenderEngine::new(
            Cursor::new(source(4000)),
            MockLink::with_script(vec![ack(0), ack(1), ack(2)]),
            config,
        );
        sender.start().unwrap();
        assert_eq!(sender.in_flight(), 1);

        sender.run().expect("Transfer should complete");
        let sent = sender.link().sent_packets();
        let lengths: Vec<usize> = sent
            .iter()
            .filter(|p| p.header.kind == MessageType::Data)
            .map(|p| p.payload.len())
            .collect();
        assert_eq!(lengths, vec![MAX_CHUNK, MAX_CHUNK, 4000 - 2 * MAX_CHUNK]);
        assert!(sender.link().sent.iter().all(|d| d.len() <= transport::MAX_DATAGRAM));
    }
}
