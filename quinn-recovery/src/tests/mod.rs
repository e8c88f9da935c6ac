use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    iter, mem,
    sync::Arc,
};

use tracing_subscriber::EnvFilter;

use crate::{
    congestion::{CongestionControl, NewRenoConfig},
    Ack, CandidateSequenceKind, Duration, Event, Frame, Instant, MtuDiscoveryConfig,
    PathProperties, Recovery, RecoveryConfig, SentPacket, SpaceId, StreamMeta,
};

mod proptest;

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

const CHUNK_SIZE: u64 = 1000;

fn stream(chunk: u64) -> Frame {
    Frame::Stream(StreamMeta {
        id: 0,
        offsets: chunk * CHUNK_SIZE..(chunk + 1) * CHUNK_SIZE,
        fin: false,
    })
}

fn chunks(packet: &SentPacket) -> impl Iterator<Item = u64> + '_ {
    packet.frames.iter().filter_map(|frame| match frame {
        Frame::Stream(meta) => Some(meta.offsets.start / CHUNK_SIZE),
        _ => None,
    })
}

fn ping(now: Instant, size: u16) -> SentPacket {
    SentPacket::new(now, size, vec![Frame::Ping])
}

fn ack(largest: u64, first_range: u64) -> Ack {
    Ack {
        largest,
        delay: 0,
        first_range,
        ranges: Vec::new(),
    }
}

fn drain(recovery: &mut Recovery) -> Vec<Event> {
    iter::from_fn(|| recovery.poll()).collect()
}

fn lost(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::PacketLost { number, .. } => Some(*number),
            _ => None,
        })
        .collect()
}

#[test]
fn handshake_then_application_data() {
    let _guard = subscribe();
    let start = Instant::now();
    let at = |ms| start + Duration::from_millis(ms);
    let mut recovery =
        Recovery::new(Arc::new(RecoveryConfig::default()), PathProperties::default(), start)
            .unwrap();

    let crypto = |offset| Frame::Crypto { offset, len: 300 };
    recovery.on_packet_sent(
        start,
        SpaceId::Initial,
        0,
        SentPacket::new(start, 1200, vec![crypto(0), Frame::Padding]),
    );
    recovery.on_packet_received(at(60), SpaceId::Initial, 0, true, false);
    assert!(recovery.immediate_ack_required(SpaceId::Initial));
    recovery
        .on_ack_received(at(60), SpaceId::Initial, &ack(0, 0))
        .unwrap();
    assert_eq!(recovery.rtt().get(), Duration::from_millis(60));

    let initial_ack = recovery
        .ack_frame(SpaceId::Initial, at(60), 100)
        .unwrap()
        .unwrap();
    recovery.on_packet_sent(
        at(60),
        SpaceId::Initial,
        1,
        SentPacket::new(
            at(60),
            1200,
            vec![
                Frame::Ack {
                    largest: initial_ack.largest,
                },
                Frame::Padding,
            ],
        ),
    );
    recovery.on_packet_sent(
        at(60),
        SpaceId::Handshake,
        0,
        SentPacket::new(at(60), 200, vec![crypto(0)]),
    );
    recovery.discard_space(SpaceId::Initial);
    // Only the handshake packet remains in flight
    assert_eq!(recovery.bytes_in_flight(), 200);

    recovery
        .on_ack_received(at(120), SpaceId::Handshake, &ack(0, 0))
        .unwrap();
    recovery.discard_space(SpaceId::Handshake);
    recovery.set_handshake_confirmed();
    assert_eq!(recovery.bytes_in_flight(), 0);
    assert_eq!(recovery.poll_timeout(), None);

    recovery.on_packet_sent(at(130), SpaceId::Data, 0, SentPacket::new(at(130), 1200, vec![stream(0)]));
    let pto = recovery.poll_timeout().unwrap();
    assert!(pto > at(130));
    recovery
        .on_ack_received(at(190), SpaceId::Data, &ack(0, 0))
        .unwrap();
    let events = drain(&mut recovery);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::PacketAcked {
            space: SpaceId::Data,
            number: 0,
            ..
        }
    )));
    let stats = recovery.stats();
    assert_eq!(stats.path.sent_packets, 4);
    assert_eq!(stats.acks_received, 3);
    assert_eq!(stats.acks_sent, 1);
}

#[test]
fn no_growth_for_acks_of_packets_sent_before_recovery() {
    let _guard = subscribe();
    let start = Instant::now();
    let at = |ms| start + Duration::from_millis(ms);
    let mut config = RecoveryConfig::default();
    let mut new_reno = NewRenoConfig::default();
    new_reno.initial_window(10_000);
    config.congestion_controller(CongestionControl::NewReno(Arc::new(new_reno)));
    let mut recovery = Recovery::new(Arc::new(config), PathProperties::default(), start).unwrap();

    for pn in 0..5 {
        recovery.on_packet_sent(start, SpaceId::Data, pn, ping(start, 1000));
    }
    recovery
        .on_ack_received(at(100), SpaceId::Data, &ack(4, 0))
        .unwrap();
    assert_eq!(lost(&drain(&mut recovery)), [0, 1]);
    let state = recovery.congestion_state();
    assert_eq!(state.metrics().ssthresh, Some(5000));
    assert_eq!(state.window(), 5000);
    // One datagram may be sent right away, regardless of the 2000 bytes in flight
    assert_eq!(recovery.remaining_congestion_window(), 1200);

    // #2 and #3 were sent before recovery started
    recovery
        .on_ack_received(at(105), SpaceId::Data, &ack(3, 1))
        .unwrap();
    assert_eq!(recovery.congestion_state().window(), 5000);
    assert_eq!(recovery.bytes_in_flight(), 0);
    assert_eq!(recovery.stats().path.congestion_events, 1);
}

#[test]
fn black_hole_invalidates_pmtu() {
    let _guard = subscribe();
    let start = Instant::now();
    let at = |ms| start + Duration::from_millis(ms);
    let mut config = RecoveryConfig::default();
    let mut mtud = MtuDiscoveryConfig::default();
    mtud.candidate_sequence(CandidateSequenceKind::OptBinary);
    config.mtu_discovery_config(Some(mtud));
    let mut recovery = Recovery::new(Arc::new(config), PathProperties::default(), start).unwrap();
    recovery.set_handshake_confirmed();

    // Base probe, then the upper bound right away
    for (pn, ms, size) in [(0, 0, 1200), (1, 100, 1452)] {
        assert_eq!(recovery.poll_pmtu_probe(at(ms)), Some(size));
        let mut probe = ping(at(ms), size);
        probe.pmtu_probe = true;
        recovery.on_packet_sent(at(ms), SpaceId::Data, pn, probe);
        recovery
            .on_ack_received(at(ms + 100), SpaceId::Data, &ack(pn, 0))
            .unwrap();
    }
    assert_eq!(recovery.current_mtu(), 1452);
    assert!(drain(&mut recovery).contains(&Event::MtuUpdated { mtu: 1452 }));
    assert_eq!(recovery.poll_pmtu_probe(at(200)), None);

    // The path stops carrying large packets while small ones still get through
    for pn in 2..12 {
        let sent = at(300 + 200 * (pn - 2));
        recovery.on_packet_sent(sent, SpaceId::Data, pn, ping(sent, 1452));
    }
    recovery.on_packet_sent(at(2200), SpaceId::Data, 12, ping(at(2200), 1200));
    recovery
        .on_ack_received(at(2300), SpaceId::Data, &ack(12, 0))
        .unwrap();

    let events = drain(&mut recovery);
    assert_eq!(lost(&events), (2..12).collect::<Vec<_>>());
    assert!(events.contains(&Event::MtuUpdated { mtu: 1200 }));
    assert_eq!(recovery.current_mtu(), 1200);
    let stats = recovery.stats();
    assert_eq!(stats.mtud.invalidations, 1);
    assert_eq!(stats.path.persistent_congestion_events, 1);
    assert_eq!(stats.path.current_mtu, 1200);
    // Discovery starts over from the base probe
    assert_eq!(recovery.poll_pmtu_probe(at(2300)), Some(1200));
}

#[test]
fn lossy_transfer_completes() {
    let _guard = subscribe();
    const CHUNKS: u64 = 40;
    let one_way = Duration::from_millis(20);
    let start = Instant::now();
    let config = Arc::new(RecoveryConfig::default());
    let mut sender = Recovery::new(config.clone(), PathProperties::default(), start).unwrap();
    let mut receiver = Recovery::new(config, PathProperties::default(), start).unwrap();
    sender.set_handshake_confirmed();
    receiver.set_handshake_confirmed();

    let mut pending = (0..CHUNKS).collect::<VecDeque<_>>();
    let mut transmitted = HashSet::new();
    let mut delivered = BTreeSet::new();
    let mut to_receiver = Vec::<(Instant, u64)>::new();
    let mut to_sender = Vec::<(Instant, Ack)>::new();
    let (mut sender_pn, mut receiver_pn) = (0, 0);
    let mut probe = false;
    let mut now = start;

    for _ in 0..2000 {
        now += Duration::from_millis(5);

        let (arrived, in_transit): (Vec<_>, Vec<_>) = mem::take(&mut to_sender)
            .into_iter()
            .partition(|&(time, _)| time <= now);
        to_sender = in_transit;
        for (_, ack) in arrived {
            sender.on_ack_received(now, SpaceId::Data, &ack).unwrap();
        }
        if sender.poll_timeout().is_some_and(|timeout| timeout <= now) {
            sender.handle_timeout(now).unwrap();
        }
        while let Some(event) = sender.poll() {
            match event {
                Event::PacketAcked { packet, .. } => delivered.extend(chunks(&packet)),
                Event::PacketLost { packet, .. } => pending.extend(chunks(&packet)),
                Event::SendProbe(_) => probe = true,
                Event::MtuUpdated { .. } => {}
            }
        }

        loop {
            if !probe && sender.remaining_congestion_window() < 1200 {
                break;
            }
            let (frame, dropped) = match pending.pop_front() {
                Some(chunk) if delivered.contains(&chunk) => continue,
                // The first transmission of every seventh chunk is dropped
                Some(chunk) => (stream(chunk), transmitted.insert(chunk) && chunk % 7 == 3),
                None if probe => (Frame::Ping, false),
                None => break,
            };
            probe = false;
            sender.on_packet_sent(now, SpaceId::Data, sender_pn, SentPacket::new(now, 1200, vec![frame]));
            if !dropped {
                to_receiver.push((now + one_way, sender_pn));
            }
            sender_pn += 1;
        }

        let (arrived, in_transit): (Vec<_>, Vec<_>) = mem::take(&mut to_receiver)
            .into_iter()
            .partition(|&(time, _)| time <= now);
        to_receiver = in_transit;
        for (_, pn) in arrived {
            receiver.on_packet_received(now, SpaceId::Data, pn, true, false);
        }
        if receiver.poll_timeout().is_some_and(|timeout| timeout <= now) {
            receiver.handle_timeout(now).unwrap();
        }
        if receiver.immediate_ack_required(SpaceId::Data) {
            let ack = receiver
                .ack_frame(SpaceId::Data, now, 1000)
                .unwrap()
                .unwrap();
            let ack_only = SentPacket::new(now, 50, vec![Frame::Ack { largest: ack.largest }]);
            receiver.on_packet_sent(now, SpaceId::Data, receiver_pn, ack_only);
            receiver_pn += 1;
            to_sender.push((now + one_way, ack));
        }

        if delivered.len() as u64 == CHUNKS && sender.bytes_in_flight() == 0 {
            break;
        }
    }

    assert_eq!(delivered, (0..CHUNKS).collect::<BTreeSet<_>>());
    assert_eq!(sender.bytes_in_flight(), 0);
    assert_eq!(sender.ack_eliciting_sent_packets(SpaceId::Data), 0);
    assert!(sender.stats().path.lost_packets >= 6);
    assert!(sender.rtt().min() >= 2 * one_way);
}
