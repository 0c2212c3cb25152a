use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use crate::event::Shutdown;
use crate::network::{NetworkLayer, Role};
use crate::packet::{CommPacket, Packet};
use crate::receiver::ReceiverEngine;
use crate::sender::SenderEngine;
use crate::stats::TransportCounters;
use crate::{RecvError, SendError, TransmissionId, MAX_PAYLOAD_SIZE};

pub(crate) mod util;
use util::{
    encoded_data_packet, fast_network, fast_transport, layer, layer_with, subscribe, test_data,
};

#[test]
fn single_transmission_roundtrip() {
    let _guard = subscribe();
    let layer = layer();
    let data = test_data(1, 2048);
    layer.send_transmission(1, &data).unwrap();
    let mut buf = vec![0; 4096];
    let received = layer
        .receive_transmission(1, &mut buf, Duration::from_secs(1))
        .unwrap();
    assert_eq!(received.id, 1);
    assert_eq!(received.len, 2048);
    assert_eq!(&buf[..2048], &data[..]);

    let stats = layer.stats();
    assert_eq!(stats.transmissions_sent, 1);
    assert_eq!(stats.transmissions_delivered, 1);
    assert!(stats.data_packets_sent >= 2);
    assert!(stats.comm_packets_sent >= 1);
    let network = layer.network().stats();
    assert!(network.sent >= 3);
    assert_eq!(network.dropped_fault, 0);
    assert_eq!(network.duplicated, 0);
}

#[test]
fn tiny_and_boundary_lengths_roundtrip() {
    let _guard = subscribe();
    let layer = layer();
    for (id, len) in [(1, 1), (2, MAX_PAYLOAD_SIZE), (3, MAX_PAYLOAD_SIZE + 1)] {
        let data = test_data(id as u64, len);
        layer.send_transmission(id, &data).unwrap();
        let mut buf = vec![0; len + 8];
        let received = layer
            .receive_transmission(id, &mut buf, Duration::from_secs(1))
            .unwrap();
        assert_eq!(received.len, len);
        assert_eq!(&buf[..len], &data[..]);
    }
}

/// Drives the sender engine against a hand-rolled receiver so the wire
/// itself can be observed: a 1025-byte transmission must appear as exactly
/// two distinct data packets (1024 + 1 bytes), modulo retransmission.
#[test]
fn packetization_splits_at_payload_boundary() {
    let _guard = subscribe();
    let shutdown = Arc::new(Shutdown::new());
    let network =
        Arc::new(NetworkLayer::with_shutdown(fast_network(), shutdown.clone()).unwrap());
    let engine = SenderEngine::new(
        network.clone(),
        &fast_transport(),
        Duration::from_millis(20),
        shutdown.clone(),
        Arc::new(TransportCounters::default()),
    )
    .unwrap();
    let data = test_data(42, 1025);

    thread::scope(|scope| {
        let sender = scope.spawn(|| engine.send_transmission(9, &data));

        let mut seen: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        while seen.len() < 2 {
            let bytes = network
                .receive_packet(Role::Receiver, Duration::from_secs(2))
                .unwrap();
            match Packet::decode(&bytes).unwrap() {
                Packet::Data(packet) => {
                    assert_eq!(packet.total, 2);
                    assert!(packet.index < 2);
                    seen.insert(packet.index, packet.payload);
                }
                Packet::Comm(_) => panic!("sender emitted a comm packet"),
            }
        }
        assert_eq!(seen[&0].len(), 1024);
        assert_eq!(seen[&1].len(), 1);
        let mut reassembled = seen[&0].clone();
        reassembled.extend_from_slice(&seen[&1]);
        assert_eq!(reassembled, data);

        let mut ack = Vec::new();
        Packet::Comm(CommPacket {
            id: TransmissionId::new(9).unwrap(),
            first_index: 0,
            bits: 2,
            bitmap: vec![0b11],
        })
        .encode(&mut ack);
        network.send_packet(&ack, Role::Receiver).unwrap();

        assert_eq!(sender.join().unwrap(), Ok(()));
    });

    shutdown.trigger();
    engine.join();
    network.shutdown();
}

/// After an index is acknowledged, later passes must stop resending it.
#[test]
fn retransmits_only_unacknowledged_indices() {
    let _guard = subscribe();
    let shutdown = Arc::new(Shutdown::new());
    let network =
        Arc::new(NetworkLayer::with_shutdown(fast_network(), shutdown.clone()).unwrap());
    let engine = SenderEngine::new(
        network.clone(),
        &fast_transport(),
        Duration::from_millis(20),
        shutdown.clone(),
        Arc::new(TransportCounters::default()),
    )
    .unwrap();
    let data = test_data(43, 2 * MAX_PAYLOAD_SIZE);
    let id = TransmissionId::new(11).unwrap();
    let ack = |first: u32, bitmap: u8| {
        let mut buf = Vec::new();
        Packet::Comm(CommPacket {
            id,
            first_index: first,
            bits: 2,
            bitmap: vec![bitmap],
        })
        .encode(&mut buf);
        buf
    };

    thread::scope(|scope| {
        let sender = scope.spawn(|| engine.send_transmission(11, &data));

        // Acknowledge index 0 as soon as it shows up.
        loop {
            let bytes = network
                .receive_packet(Role::Receiver, Duration::from_secs(2))
                .unwrap();
            if let Packet::Data(packet) = Packet::decode(&bytes).unwrap() {
                if packet.index == 0 {
                    network.send_packet(&ack(0, 0b01), Role::Receiver).unwrap();
                    break;
                }
            }
        }

        // Let several retry intervals elapse, discard the backlog that was
        // already in flight, then watch a clean window.
        thread::sleep(Duration::from_millis(200));
        while network.try_receive_packet(Role::Receiver).is_some() {}
        for _ in 0..4 {
            let bytes = network
                .receive_packet(Role::Receiver, Duration::from_secs(2))
                .unwrap();
            if let Packet::Data(packet) = Packet::decode(&bytes).unwrap() {
                assert_eq!(packet.index, 1, "acknowledged index was retransmitted");
            }
        }

        network.send_packet(&ack(0, 0b11), Role::Receiver).unwrap();
        assert_eq!(sender.join().unwrap(), Ok(()));
    });

    shutdown.trigger();
    engine.join();
    network.shutdown();
}

#[test]
fn survives_heavy_packet_loss() {
    let _guard = subscribe();
    let layer = layer_with(
        |network| {
            network.drop_rate(25).fault_seed(7);
        },
        |_| {},
    );
    let data = test_data(3, 65536);
    let started = Instant::now();
    layer.send_transmission(21, &data).unwrap();
    let mut buf = vec![0; 65536];
    let received = layer
        .receive_transmission(21, &mut buf, Duration::from_secs(3))
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(received.len, 65536);
    assert_eq!(buf, data);

    // 64 packets minimum; the 25% loss forces retransmission on top.
    let stats = layer.stats();
    assert!(stats.data_packets_sent > 64);
    assert!(layer.network().stats().dropped_fault > 0);
}

#[test]
fn survives_a_range_of_drop_rates() {
    let _guard = subscribe();
    for (rate, id) in [(1, 31), (10, 32), (25, 33)] {
        let layer = layer_with(
            |network| {
                network.drop_rate(rate).fault_seed(rate as u64);
            },
            |_| {},
        );
        let data = test_data(rate as u64, 16 * 1024);
        layer.send_transmission(id, &data).unwrap();
        let mut buf = vec![0; data.len()];
        let received = layer
            .receive_transmission(id, &mut buf, Duration::from_secs(3))
            .unwrap();
        assert_eq!(received.len, data.len());
        assert_eq!(buf, data);
    }
}

#[test]
fn duplicates_do_not_change_delivery() {
    let _guard = subscribe();
    for (rate, id) in [(30, 51), (100, 52)] {
        let layer = layer_with(
            |network| {
                network.duplicate_rate(rate).fault_seed(11);
            },
            |_| {},
        );
        let data = test_data(100 + rate as u64, 16 * 1024);
        layer.send_transmission(id, &data).unwrap();
        let mut buf = vec![0; data.len()];
        let received = layer
            .receive_transmission(id, &mut buf, Duration::from_secs(3))
            .unwrap();
        assert_eq!(received.len, data.len());
        assert_eq!(buf, data);
        if rate == 100 {
            assert!(layer.network().stats().duplicated > 0);
            assert!(layer.stats().duplicates_discarded > 0);
        }
    }
}

#[test]
fn reordering_is_invisible_to_reassembly() {
    let _guard = subscribe();
    let layer = layer_with(
        |network| {
            network.reorder(true).fault_seed(13);
        },
        |_| {},
    );
    let data = test_data(5, 8192);
    layer.send_transmission(61, &data).unwrap();
    let mut buf = vec![0; data.len()];
    let received = layer
        .receive_transmission(61, &mut buf, Duration::from_secs(3))
        .unwrap();
    assert_eq!(received.len, data.len());
    assert_eq!(buf, data);
}

/// No checksum exists, so corruption is not detected; the engine must
/// merely stay sane: calls return, nothing deadlocks or panics.
#[test]
fn corruption_does_not_wedge_the_engine() {
    let _guard = subscribe();
    let layer = layer_with(
        |network| {
            network.corrupt_rate(10).fault_seed(17);
        },
        |transport| {
            transport.send_budget(Duration::from_secs(2));
        },
    );
    let data = test_data(6, 8192);
    let sent = layer.send_transmission(71, &data);
    assert_matches!(sent, Ok(()) | Err(SendError::TimedOut));
    let mut buf = vec![0; data.len()];
    let received = layer.receive_transmission(71, &mut buf, Duration::from_millis(500));
    assert_matches!(received, Ok(_) | Err(RecvError::Timeout));
}

#[test]
fn concurrent_transmissions_stay_separate() {
    let _guard = subscribe();
    let layer = layer();
    thread::scope(|scope| {
        let layer = &layer;
        scope.spawn(move || layer.send_transmission(7, &test_data(7, 4096)).unwrap());
        scope.spawn(move || layer.send_transmission(42, &test_data(42, 8192)).unwrap());
        scope.spawn(move || {
            let mut buf = vec![0; 8192];
            let received = layer
                .receive_transmission(7, &mut buf, Duration::from_secs(3))
                .unwrap();
            assert_eq!((received.id, received.len), (7, 4096));
            assert_eq!(&buf[..4096], &test_data(7, 4096)[..]);
        });
        scope.spawn(move || {
            let mut buf = vec![0; 8192];
            let received = layer
                .receive_transmission(42, &mut buf, Duration::from_secs(3))
                .unwrap();
            assert_eq!((received.id, received.len), (42, 8192));
            assert_eq!(&buf[..8192], &test_data(42, 8192)[..]);
        });
    });
}

#[test]
fn many_senders_many_wildcard_receivers() {
    let _guard = subscribe();
    let layer = layer();
    const COUNT: u32 = 8;
    const LEN: usize = 8192;
    let collected = thread::scope(|scope| {
        let layer = &layer;
        for id in 1..=COUNT {
            scope.spawn(move || {
                layer
                    .send_transmission(id, &test_data(id as u64, LEN))
                    .unwrap()
            });
        }
        let receivers: Vec<_> = (0..COUNT)
            .map(|_| {
                scope.spawn(move || {
                    let mut buf = vec![0; LEN];
                    let received = layer
                        .receive_transmission(0, &mut buf, Duration::from_secs(5))
                        .unwrap();
                    assert_eq!(received.len, LEN);
                    assert_eq!(buf, test_data(received.id as u64, LEN));
                    received.id
                })
            })
            .collect();
        receivers
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<BTreeSet<u32>>()
    });
    assert_eq!(collected, (1..=COUNT).collect::<BTreeSet<u32>>());
}

#[test]
fn wildcard_and_by_id_share_the_queue() {
    let _guard = subscribe();
    let layer = layer();
    layer.send_transmission(1, &test_data(201, 2000)).unwrap();
    layer.send_transmission(2, &test_data(202, 3000)).unwrap();
    let mut buf = vec![0; 4096];
    // Claim id 2 explicitly; the wildcard must then deliver id 1.
    let by_id = layer
        .receive_transmission(2, &mut buf, Duration::from_secs(1))
        .unwrap();
    assert_eq!((by_id.id, by_id.len), (2, 3000));
    let wildcard = layer
        .receive_transmission(0, &mut buf, Duration::from_secs(1))
        .unwrap();
    assert_eq!((wildcard.id, wildcard.len), (1, 2000));
}

#[test]
fn timeout_leaves_destination_untouched() {
    let _guard = subscribe();
    let layer = layer();
    let mut buf = vec![0xEE; 256];
    let started = Instant::now();
    assert_matches!(
        layer.receive_transmission(99, &mut buf, Duration::from_millis(50)),
        Err(RecvError::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(buf.iter().all(|&byte| byte == 0xEE));
}

#[test]
fn shutdown_aborts_inflight_send() {
    let _guard = subscribe();
    let layer = layer_with(
        |network| {
            network.latency(Duration::from_millis(40));
        },
        |_| {},
    );
    let data = test_data(9, 1024 * 1024);
    thread::scope(|scope| {
        let layer = &layer;
        let sender = scope.spawn(move || layer.send_transmission(3, &data));
        thread::sleep(Duration::from_millis(10));
        layer.shutdown();
        assert_eq!(sender.join().unwrap(), Err(SendError::ShuttingDown));
    });
    let mut buf = [0u8; 8];
    assert_matches!(
        layer.receive_transmission(3, &mut buf, Duration::from_millis(10)),
        Err(RecvError::ShuttingDown)
    );
}

#[test]
fn rejects_invalid_arguments() {
    let _guard = subscribe();
    let layer = layer();
    assert_eq!(layer.send_transmission(0, b"x"), Err(SendError::InvalidId));
    assert_eq!(
        layer.send_transmission(1 << 31, b"x"),
        Err(SendError::InvalidId)
    );
    assert_eq!(
        layer.send_transmission(1, b""),
        Err(SendError::EmptyTransmission)
    );
    let mut buf = [0u8; 8];
    assert_eq!(
        layer.receive_transmission(u32::MAX, &mut buf, Duration::from_millis(1)),
        Err(RecvError::InvalidId)
    );
}

#[test]
fn same_id_cannot_be_sent_twice_concurrently() {
    let _guard = subscribe();
    let layer = layer_with(
        |network| {
            network.latency(Duration::from_millis(200));
        },
        |_| {},
    );
    let data = test_data(12, 1024);
    thread::scope(|scope| {
        let layer = &layer;
        let data = &data;
        let first = scope.spawn(move || layer.send_transmission(5, data));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            layer.send_transmission(5, data),
            Err(SendError::AlreadyInFlight)
        );
        assert_eq!(first.join().unwrap(), Ok(()));
    });
}

#[test]
fn small_destination_preserves_the_record() {
    let _guard = subscribe();
    let layer = layer();
    let data = test_data(30, 100);
    layer.send_transmission(3, &data).unwrap();
    let mut tiny = [0u8; 10];
    assert_eq!(
        layer.receive_transmission(3, &mut tiny, Duration::from_secs(1)),
        Err(RecvError::BufferTooSmall)
    );
    let mut buf = vec![0; 1024];
    let received = layer
        .receive_transmission(3, &mut buf, Duration::from_secs(1))
        .unwrap();
    assert_eq!(received.len, 100);
    assert_eq!(&buf[..100], &data[..]);
}

#[test]
fn receiver_can_wait_before_the_sender_starts() {
    let _guard = subscribe();
    let layer = layer();
    thread::scope(|scope| {
        let layer = &layer;
        let receiver = scope.spawn(move || {
            let mut buf = vec![0; 4096];
            let received = layer
                .receive_transmission(5, &mut buf, Duration::from_secs(3))
                .unwrap();
            assert_eq!(received.len, 3000);
            assert_eq!(&buf[..3000], &test_data(50, 3000)[..]);
        });
        thread::sleep(Duration::from_millis(40));
        layer.send_transmission(5, &test_data(50, 3000)).unwrap();
        receiver.join().unwrap();
    });
}

/// Tiny NICs force the sender through its full-buffer backoff path; the
/// transmission must still complete rather than deadlock.
#[test]
fn completes_through_tiny_nic_buffers() {
    let _guard = subscribe();
    let layer = layer_with(
        |network| {
            network.nic_slots(4);
        },
        |_| {},
    );
    let data = test_data(14, 65536);
    layer.send_transmission(8, &data).unwrap();
    let mut buf = vec![0; data.len()];
    let received = layer
        .receive_transmission(8, &mut buf, Duration::from_secs(3))
        .unwrap();
    assert_eq!(received.len, data.len());
    assert_eq!(buf, data);
}

/// Drives the receiver engine from a hand-rolled sender: out-of-order and
/// duplicate arrivals reassemble exactly once, and data that straggles in
/// after delivery is answered with a fresh full acknowledgement instead of
/// resurrecting the transmission.
#[test]
fn receiver_handles_disorder_duplicates_and_stragglers() {
    let _guard = subscribe();
    let shutdown = Arc::new(Shutdown::new());
    let network =
        Arc::new(NetworkLayer::with_shutdown(fast_network(), shutdown.clone()).unwrap());
    let receiver = ReceiverEngine::new(
        network.clone(),
        &fast_transport(),
        shutdown.clone(),
        Arc::new(TransportCounters::default()),
    )
    .unwrap();
    let data = test_data(77, MAX_PAYLOAD_SIZE + 100);
    let chunks = [&data[..MAX_PAYLOAD_SIZE], &data[MAX_PAYLOAD_SIZE..]];
    let packet = |index: u32| encoded_data_packet(4, index, 2, chunks[index as usize]);
    let next_comm = |deadline: Duration| loop {
        let bytes = network.receive_packet(Role::Sender, deadline).unwrap();
        if let Packet::Comm(comm) = Packet::decode(&bytes).unwrap() {
            break comm;
        }
    };

    // Final chunk first, then a duplicate of it, then the opening chunk.
    network.send_packet(&packet(1), Role::Sender).unwrap();
    network.send_packet(&packet(1), Role::Sender).unwrap();
    network.send_packet(&packet(0), Role::Sender).unwrap();
    let completion = loop {
        let comm = next_comm(Duration::from_secs(2));
        assert_eq!(comm.id.value(), 4);
        if comm.bit(0) && comm.bit(1) {
            break comm;
        }
    };
    assert_eq!(completion.bits, 2);

    let mut buf = vec![0; data.len()];
    let received = receiver
        .receive_transmission(4, &mut buf, Duration::from_secs(1))
        .unwrap();
    assert_eq!(received.len, data.len());
    assert_eq!(buf, data);

    // A straggling retransmission after delivery: the record is gone, but
    // the receiver still acknowledges so the sender can finish.
    network.send_packet(&packet(0), Role::Sender).unwrap();
    let reack = next_comm(Duration::from_secs(2));
    assert_eq!(reack.id.value(), 4);
    assert!(reack.bit(0) && reack.bit(1));

    shutdown.trigger();
    receiver.join();
    network.shutdown();
}
