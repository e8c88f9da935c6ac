use std::{
    collections::{BTreeMap, BTreeSet},
    iter,
    sync::Arc,
};

use bytes::BytesMut;
use proptest::{
    collection::{btree_set, vec},
    prelude::*,
    sample::select,
};
use test_strategy::{proptest, Arbitrary};

use super::subscribe;
use crate::{
    Ack, CandidateSequenceKind, ConnectionError, Duration, Event, Frame, Instant,
    MtuDiscoveryConfig, PathProperties, Recovery, RecoveryConfig, SentPacket, SpaceId,
};

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Send {
        #[strategy(20..1500u16)]
        size: u16,
        ack_eliciting: bool,
    },
    /// Acknowledge `len + 1` packets, `gap` packets below the largest sent
    Ack {
        #[strategy(0..8u64)]
        gap: u64,
        #[strategy(0..6u64)]
        len: u64,
    },
    Advance(#[strategy(1..400u64)] u64),
    Timeout,
}

fn confirmed(config: RecoveryConfig, now: Instant) -> Recovery {
    let mut recovery = Recovery::new(Arc::new(config), PathProperties::default(), now).unwrap();
    recovery.set_handshake_confirmed();
    recovery
}

#[proptest(cases = 256)]
fn sender_accounting(#[strategy(vec(any::<Op>(), 0..100))] ops: Vec<Op>) {
    let _guard = subscribe();
    let mut now = Instant::now();
    let mut recovery = confirmed(RecoveryConfig::default(), now);
    // Packets that were neither acknowledged nor declared lost
    let mut outstanding = BTreeMap::<u64, SentPacket>::new();
    let mut next_pn = 0;
    let mut largest_acked = None;

    for op in ops {
        match op {
            Op::Send {
                size,
                ack_eliciting,
            } => {
                let frames = if ack_eliciting {
                    vec![Frame::Ping]
                } else {
                    vec![Frame::Ack { largest: 0 }]
                };
                let packet = SentPacket::new(now, size, frames);
                recovery.on_packet_sent(now, SpaceId::Data, next_pn, packet.clone());
                outstanding.insert(next_pn, packet);
                next_pn += 1;
            }
            Op::Ack { gap, len } => {
                let Some(largest_sent) = next_pn.checked_sub(1) else {
                    continue;
                };
                let largest = largest_sent.saturating_sub(gap);
                let ack = Ack {
                    largest,
                    delay: 0,
                    first_range: len.min(largest),
                    ranges: Vec::new(),
                };
                recovery.on_ack_received(now, SpaceId::Data, &ack).unwrap();
                let in_flight = recovery.bytes_in_flight();
                let events = iter::from_fn(|| recovery.poll()).collect::<Vec<_>>();

                // The same ACK again changes nothing
                recovery.on_ack_received(now, SpaceId::Data, &ack).unwrap();
                prop_assert_eq!(recovery.poll(), None);
                prop_assert_eq!(recovery.bytes_in_flight(), in_flight);

                for event in events {
                    if let Event::PacketAcked { number, .. } | Event::PacketLost { number, .. } =
                        event
                    {
                        prop_assert!(outstanding.remove(&number).is_some());
                    }
                }

                let acked = recovery.largest_acked_packet(SpaceId::Data);
                prop_assert!(acked >= largest_acked);
                prop_assert!(acked >= Some(largest));
                largest_acked = acked;
            }
            Op::Advance(ms) => now += Duration::from_millis(ms),
            Op::Timeout => {
                if recovery.poll_timeout().is_some_and(|t| t <= now) {
                    match recovery.handle_timeout(now) {
                        Ok(()) | Err(ConnectionError::TimedOut) => {}
                        Err(e) => prop_assert!(false, "unexpected error {e}"),
                    }
                }
                while let Some(event) = recovery.poll() {
                    if let Event::PacketLost { number, .. } = event {
                        prop_assert!(outstanding.remove(&number).is_some());
                    }
                }
            }
        }

        let expected = outstanding
            .values()
            .filter(|packet| packet.in_flight)
            .map(|packet| u64::from(packet.size))
            .sum::<u64>();
        prop_assert_eq!(recovery.bytes_in_flight(), expected);
    }
}

#[proptest(cases = 256)]
fn ack_frames_report_received_packets(
    #[strategy(btree_set(0..300u64, 1..64))] received: BTreeSet<u64>,
    #[strategy(0..64usize)] max_size: usize,
) {
    let now = Instant::now();
    let mut recovery = confirmed(RecoveryConfig::default(), now);
    for &pn in &received {
        recovery.on_packet_received(now, SpaceId::Data, pn, true, false);
    }

    match recovery.ack_frame(SpaceId::Data, now, max_size) {
        Ok(Some(ack)) => {
            prop_assert!(ack.size() <= max_size);
            let mut buf = BytesMut::new();
            ack.encode(&mut buf);
            prop_assert_eq!(buf.len(), ack.size());
            prop_assert_eq!(&Ack::decode(&mut buf.freeze()).unwrap(), &ack);

            let acked = ack.iter().flatten().collect::<BTreeSet<_>>();
            prop_assert!(acked.contains(received.last().unwrap()));
            prop_assert!(acked.is_subset(&received));
            prop_assert_eq!(ack.smallest().ok(), acked.first().copied());
        }
        Ok(None) => prop_assert!(false, "packets were received"),
        Err(e) => prop_assert_eq!(e, ConnectionError::AckFrameTooLarge { max_size }),
    }

    // With enough room, every received packet is reported
    recovery.on_packet_received(now, SpaceId::Data, *received.last().unwrap() + 1, true, false);
    let ack = recovery.ack_frame(SpaceId::Data, now, 1000).unwrap().unwrap();
    let acked = ack.iter().flatten().collect::<BTreeSet<_>>();
    prop_assert_eq!(acked.len(), received.len() + 1);
    prop_assert!(received.is_subset(&acked));
}

const KINDS: &[CandidateSequenceKind] = &[
    CandidateSequenceKind::Up,
    CandidateSequenceKind::Down,
    CandidateSequenceKind::Binary,
    CandidateSequenceKind::OptBinary,
    CandidateSequenceKind::OptUp,
    CandidateSequenceKind::Jump,
];

#[derive(Debug, Clone, Arbitrary)]
enum PathOp {
    /// Send the pending PMTU probe, if any
    Probe,
    /// Acknowledge every probe that was neither acknowledged nor lost yet
    AckProbes,
    /// Send a minimum size packet and acknowledge it right away, implicitly reporting earlier
    /// packets as missing
    Data,
    PacketTooBig(#[strategy(1100..1600u16)] u16),
    Advance(#[strategy(1..2000u64)] u64),
}

#[proptest(cases = 256)]
fn pmtu_stays_within_bounds(
    #[strategy(select(KINDS))] kind: CandidateSequenceKind,
    #[strategy(vec(any::<PathOp>(), 0..100))] ops: Vec<PathOp>,
) {
    let _guard = subscribe();
    let mut now = Instant::now();
    let mut mtud = MtuDiscoveryConfig::default();
    mtud.candidate_sequence(kind);
    let mut config = RecoveryConfig::default();
    config.mtu_discovery_config(Some(mtud));
    let mut recovery = confirmed(config, now);
    let mut probes = Vec::new();
    let mut next_pn = 0;

    // Stops at the first connection error, after which the state is no longer used
    'ops: for op in ops {
        match op {
            PathOp::Probe => {
                if let Some(size) = recovery.poll_pmtu_probe(now) {
                    prop_assert!((1200..=1452).contains(&size));
                    let mut packet = SentPacket::new(now, size, vec![Frame::Ping]);
                    packet.pmtu_probe = true;
                    recovery.on_packet_sent(now, SpaceId::Data, next_pn, packet);
                    probes.push(next_pn);
                    next_pn += 1;
                }
            }
            PathOp::AckProbes => {
                for pn in probes.drain(..) {
                    let ack = Ack {
                        largest: pn,
                        delay: 0,
                        first_range: 0,
                        ranges: Vec::new(),
                    };
                    if recovery.on_ack_received(now, SpaceId::Data, &ack).is_err() {
                        break 'ops;
                    }
                }
            }
            PathOp::Data => {
                let size = recovery.safe_packet_size();
                let packet = SentPacket::new(now, size, vec![Frame::Ping]);
                recovery.on_packet_sent(now, SpaceId::Data, next_pn, packet);
                now += Duration::from_millis(10);
                let ack = Ack {
                    largest: next_pn,
                    delay: 0,
                    first_range: 0,
                    ranges: Vec::new(),
                };
                next_pn += 1;
                if recovery.on_ack_received(now, SpaceId::Data, &ack).is_err() {
                    break 'ops;
                }
            }
            PathOp::PacketTooBig(link_mtu) => {
                if let Some(&pn) = probes.last() {
                    recovery.on_packet_too_big(now, SpaceId::Data, pn, link_mtu);
                }
            }
            PathOp::Advance(ms) => {
                now += Duration::from_millis(ms);
                if recovery.poll_timeout().is_some_and(|t| t <= now)
                    && recovery.handle_timeout(now).is_err()
                {
                    break 'ops;
                }
            }
        }
        while recovery.poll().is_some() {}

        let mtu = recovery.current_mtu();
        prop_assert!((1200..=1452).contains(&mtu), "PMTU {mtu} out of bounds");
        prop_assert_eq!(recovery.stats().path.current_mtu, mtu);
        prop_assert!(recovery.congestion_state().window() >= 2 * u64::from(mtu));
    }
}
