//! Connection setup and teardown between two simulated endpoints.

use std::time::Duration;

use bytes::Bytes;
use ost::{
    sim::{ChannelConfig, Network},
    Accept, Config, Flags, Mode, OstError, Segment, State,
};

const CLIENT: u8 = 1;
const SERVER: u8 = 2;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn network(config: Config) -> Network {
    init_tracing();
    let mut net = Network::new(ChannelConfig::default().with_delay(Duration::from_millis(2)));
    net.add_endpoint(CLIENT, config.clone()).unwrap();
    net.add_endpoint(SERVER, config).unwrap();
    net
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn three_way_handshake_anchors_at_initial_sequence() {
    let mut net = network(Config::default().with_initial_sequence(7));
    net.open(SERVER, CLIENT, Mode::ConnectionPassive).unwrap();
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), Some(State::SynSent));

    // SYN lands at 2ms.
    net.run_until(ms(2)).unwrap();
    let server = net.endpoint(SERVER).unwrap();
    assert_eq!(server.state(CLIENT), Some(State::SynRcvd));
    let window = server.connection(CLIENT).unwrap().window();
    assert_eq!(window.tx_window(), (7, 7));
    assert_eq!(window.rx_window().0, 7);

    // SYN+ACK at 4ms, ACK at 6ms.
    net.run_until(ms(4)).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), Some(State::Open));
    net.run_until(ms(6)).unwrap();
    assert_eq!(net.endpoint(SERVER).unwrap().state(CLIENT), Some(State::Open));
}

#[test]
fn lost_syn_ack_is_recovered() {
    let mut net = network(Config::default());
    net.open(SERVER, CLIENT, Mode::ConnectionPassive).unwrap();
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();
    net.drop_next(CLIENT, 1);

    net.run_for(ms(100)).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), Some(State::SynSent));
    assert_eq!(net.endpoint(SERVER).unwrap().state(CLIENT), Some(State::SynRcvd));

    net.run_for(ms(1000)).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), Some(State::Open));
    assert_eq!(net.endpoint(SERVER).unwrap().state(CLIENT), Some(State::Open));
}

#[test]
fn lost_final_ack_is_recovered() {
    let mut net = network(Config::default());
    net.open(SERVER, CLIENT, Mode::ConnectionPassive).unwrap();
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();

    // SYN goes through, then drop the ACK on its way to the server.
    net.run_until(ms(2)).unwrap();
    net.drop_next(SERVER, 1);

    net.run_for(ms(1000)).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), Some(State::Open));
    assert_eq!(net.endpoint(SERVER).unwrap().state(CLIENT), Some(State::Open));
}

#[test]
fn accept_policy_creates_passive_connection() {
    let mut net = network(Config::default());
    net.endpoint_mut(SERVER).unwrap().accept(Accept::Connection);
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();

    net.run_for(ms(50)).unwrap();
    assert_eq!(net.endpoint(SERVER).unwrap().peers(), vec![CLIENT]);
    assert_eq!(net.endpoint(SERVER).unwrap().state(CLIENT), Some(State::Open));
}

#[test]
fn syn_to_silent_endpoint_is_reset() {
    let mut net = network(Config::default());
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();

    // No accept policy on the server: it answers RST and the client gives up.
    net.run_for(ms(50)).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), None);
    assert!(net.endpoint(CLIENT).unwrap().peers().is_empty());
}

#[test]
fn handshake_gives_up_after_retries() {
    let config = Config::default()
        .with_handshake_retries(3)
        .with_retransmission_interval(ms(20));
    let mut net = network(config);
    net.set_loss_rate(1.0);
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();

    net.run_for(ms(1000)).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), None);
    // SYN, three resends, then the RST.
    assert_eq!(net.dropped(), 5);
}

#[test]
fn close_lingers_then_releases_both_sides() {
    let config = Config::default().with_close_wait_interval(ms(200));
    let mut net = network(config);
    net.open(SERVER, CLIENT, Mode::ConnectionPassive).unwrap();
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();
    net.run_for(ms(20)).unwrap();

    net.close(CLIENT, SERVER).unwrap();
    assert_eq!(net.endpoint(CLIENT).unwrap().state(SERVER), Some(State::CloseWait));

    // The RST moves the server into CLOSE_WAIT as well.
    net.run_for(ms(10)).unwrap();
    assert_eq!(net.endpoint(SERVER).unwrap().state(CLIENT), Some(State::CloseWait));

    net.run_for(ms(300)).unwrap();
    assert!(net.endpoint(CLIENT).unwrap().peers().is_empty());
    assert!(net.endpoint(SERVER).unwrap().peers().is_empty());
}

#[test]
fn write_before_open_is_rejected() {
    let mut net = network(Config::default());
    net.open(CLIENT, SERVER, Mode::ConnectionActive).unwrap();
    assert_eq!(
        net.write(CLIENT, SERVER, Bytes::from_static(b"early")),
        Err(OstError::WrongState(State::SynSent))
    );
}

#[test]
fn open_to_self_is_rejected() {
    let mut net = network(Config::default());
    assert_eq!(
        net.open(CLIENT, CLIENT, Mode::ConnectionActive),
        Err(OstError::BadAddress(CLIENT))
    );
}

#[test]
fn stray_data_on_closed_endpoint_gets_rst() {
    let mut net = network(Config::default());
    let stray = Segment::new(Flags::DATA, 3, CLIENT, Bytes::from_static(b"?")).encode();
    let mut sched: ost::EventQueue<ost::TimerEvent> = ost::EventQueue::new();

    let server = net.endpoint_mut(SERVER).unwrap();
    server.on_receive(stray, &mut sched).unwrap();
    assert_eq!(server.stats().segments_sent, 1);
    assert!(server.peers().is_empty());
}
