//! End-to-end data transfer over a simulated serial line.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ost::{
    constants::MAX_SEGMENT_SIZE,
    sim::{ChannelConfig, Network},
    Config, Mode, State,
};

const A: u8 = 1;
const B: u8 = 2;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn network(channel: ChannelConfig, config: Config) -> Network {
    init_tracing();
    let mut net = Network::new(channel);
    net.add_endpoint(A, config.clone()).unwrap();
    net.add_endpoint(B, config).unwrap();
    net
}

/// A message long enough to span many segments, with no repeating pattern
/// that could hide reordering.
fn message(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i * 7 + i / 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

fn write_chunked(net: &mut Network, from: u8, to: u8, message: &Bytes) {
    for chunk in message.chunks(MAX_SEGMENT_SIZE) {
        net.write(from, to, Bytes::copy_from_slice(chunk)).unwrap();
    }
}

fn reassemble(net: &mut Network, at: u8, from: u8) -> Bytes {
    let mut buf = BytesMut::new();
    for (peer, payload) in net.received(at) {
        assert_eq!(*peer, from);
        buf.extend_from_slice(payload);
    }
    buf.freeze()
}

#[test]
fn connectionless_transfer_survives_loss() {
    let channel = ChannelConfig::default().with_loss_rate(0.3).with_seed(0x5eed);
    let mut net = network(channel, Config::default());
    net.open(A, B, Mode::Connectionless).unwrap();
    net.open(B, A, Mode::Connectionless).unwrap();

    let msg = message(5000);
    write_chunked(&mut net, A, B, &msg);
    net.run_for(Duration::from_secs(120)).unwrap();

    assert_eq!(reassemble(&mut net, B, A), msg);
    assert!(net.dropped() > 0);
    assert!(net.endpoint(A).unwrap().stats().retransmissions > 0);
    assert!(net.endpoint(A).unwrap().connection(B).unwrap().window().is_idle());
}

#[test]
fn connection_transfer_survives_loss_both_ways() {
    let mut net = network(ChannelConfig::default().with_seed(11), Config::default());
    net.open(B, A, Mode::ConnectionPassive).unwrap();
    net.open(A, B, Mode::ConnectionActive).unwrap();
    net.run_for(Duration::from_millis(20)).unwrap();
    assert_eq!(net.endpoint(A).unwrap().state(B), Some(State::Open));
    assert_eq!(net.endpoint(B).unwrap().state(A), Some(State::Open));

    net.set_loss_rate(0.3);
    let to_b = message(4000);
    let to_a = message(2500).slice(100..);
    write_chunked(&mut net, A, B, &to_b);
    write_chunked(&mut net, B, A, &to_a);
    net.run_for(Duration::from_secs(120)).unwrap();

    assert_eq!(reassemble(&mut net, B, A), to_b);
    assert_eq!(reassemble(&mut net, A, B), to_a);

    net.set_loss_rate(0.0);
    net.close(A, B).unwrap();
    net.run_for(Duration::from_secs(5)).unwrap();
    assert!(net.endpoint(A).unwrap().peers().is_empty());
    assert!(net.endpoint(B).unwrap().peers().is_empty());
}

#[test]
fn sequence_numbers_wrap_many_times() {
    let config = Config::default().with_send_queue_limit(None);
    let channel = ChannelConfig::default().with_loss_rate(0.1).with_seed(99);
    let mut net = network(channel, config);
    net.open(A, B, Mode::Connectionless).unwrap();
    net.open(B, A, Mode::Connectionless).unwrap();

    for i in 0..700u16 {
        net.write(A, B, Bytes::copy_from_slice(&i.to_be_bytes())).unwrap();
    }
    net.run_for(Duration::from_secs(300)).unwrap();

    let got: Vec<u16> = net
        .received(B)
        .iter()
        .map(|(_, p)| u16::from_be_bytes([p[0], p[1]]))
        .collect();
    assert_eq!(got, (0..700u16).collect::<Vec<_>>());
}

#[test]
fn outbound_queue_limit_reports_busy() {
    let config = Config::default().with_send_queue_limit(Some(4));
    let mut net = network(ChannelConfig::default(), config);
    net.open(A, B, Mode::Connectionless).unwrap();

    for _ in 0..4 {
        net.write(A, B, Bytes::from_static(b"q")).unwrap();
    }
    assert_eq!(
        net.write(A, B, Bytes::from_static(b"q")),
        Err(ost::OstError::Busy(4))
    );
}

#[test]
fn queued_writes_wait_for_link() {
    let mut net = network(ChannelConfig::default(), Config::default());
    net.open(A, B, Mode::Connectionless).unwrap();
    net.open(B, A, Mode::Connectionless).unwrap();

    net.set_link_up(A, false).unwrap();
    for i in 0..3u8 {
        net.write(A, B, Bytes::from(vec![i])).unwrap();
    }
    net.run_for(Duration::from_secs(1)).unwrap();
    assert!(net.received(B).is_empty());
    assert_eq!(net.endpoint(A).unwrap().connection(B).unwrap().window().queued(), 3);

    net.set_link_up(A, true).unwrap();
    net.run_for(Duration::from_secs(1)).unwrap();
    assert_eq!(net.received(B).len(), 3);
}

#[test]
fn link_outage_is_bridged_by_retransmission() {
    let mut net = network(ChannelConfig::default(), Config::default());
    net.open(A, B, Mode::Connectionless).unwrap();
    net.open(B, A, Mode::Connectionless).unwrap();

    net.drop_next(B, 5);
    for i in 0..5u8 {
        net.write(A, B, Bytes::from(vec![i])).unwrap();
    }
    net.run_for(Duration::from_millis(10)).unwrap();
    net.set_link_up(A, false).unwrap();

    net.run_for(Duration::from_secs(1)).unwrap();
    assert!(net.received(B).is_empty());
    assert!(net.endpoint(A).unwrap().stats().link_failures >= 5);

    net.set_link_up(A, true).unwrap();
    net.run_for(Duration::from_secs(1)).unwrap();
    let got: Vec<u8> = net.received(B).iter().map(|(_, p)| p[0]).collect();
    assert_eq!(got, vec![0, 1, 2, 3, 4]);
}
