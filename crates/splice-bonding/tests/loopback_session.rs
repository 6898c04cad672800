//! End-to-end sessions over 127.0.0.1: four source servers and one client,
//! each on its own socket, running the real handshake, splice schedule,
//! retransmission and FIN exchange.

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use splice_bonding::config::SpliceConfig;
use splice_bonding::error::SessionError;
use splice_bonding::receiver::session::ClientSession;
use splice_bonding::sender::server::{ServerOutcome, ServerReport, SourceServer};
use splice_bonding::sender::source::{Catalog, SyntheticSource};
use splice_transport::session::SessionState;
use splice_transport::wire::{
    parse, Message, StreamInfo, CLIENT_ID, DATA_LEN, DATA_PACKET_LEN, SOURCE_COUNT, TEST_FILENAME,
};

const PACKETS: u32 = 200;

fn test_config() -> SpliceConfig {
    let mut config = SpliceConfig::default();
    config.server.synthetic_packets = PACKETS;
    // fast enough for a test, slow enough not to overrun loopback buffers
    config.rate.max_kbps = 20_000;
    // never re-split during the test
    config.splice.threshold = u32::MAX;
    config.buffer.capacity = 512;
    config.buffer.lost_threshold = 50;
    config.buffer.check_interval = Duration::from_millis(20);
    config.session.recv_timeout = Duration::from_millis(500);
    config.session.fin_grace = Duration::from_millis(500);
    config.session.max_consecutive_errors = 10;
    config
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("splice-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

struct Sources {
    addrs: [SocketAddr; SOURCE_COUNT],
    cancel: Vec<Arc<AtomicBool>>,
    handles: Vec<ServerHandle>,
}

impl Sources {
    /// Start one server per catalog, on ephemeral loopback ports.
    fn spawn(config: &SpliceConfig, catalogs: Vec<Catalog>) -> Self {
        let mut addrs = Vec::new();
        let mut cancel = Vec::new();
        let mut handles = Vec::new();
        for (id, catalog) in catalogs.into_iter().enumerate() {
            let (addr, flag, handle) = spawn_server(config, id as u8, catalog);
            addrs.push(addr);
            cancel.push(flag);
            handles.push(handle);
        }
        Self {
            addrs: addrs.try_into().unwrap(),
            cancel,
            handles,
        }
    }

    fn join(self) -> Vec<Result<ServerReport, SessionError>> {
        self.handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn cancel_and_join(self) -> Vec<Result<ServerReport, SessionError>> {
        for flag in &self.cancel {
            flag.store(true, Ordering::Relaxed);
        }
        self.join()
    }
}

type ServerHandle = JoinHandle<Result<ServerReport, SessionError>>;

fn spawn_server(
    config: &SpliceConfig,
    id: u8,
    catalog: Catalog,
) -> (SocketAddr, Arc<AtomicBool>, ServerHandle) {
    let mut server =
        SourceServer::bind(id, "127.0.0.1:0".parse().unwrap(), config.clone(), catalog).unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = server.cancel_token();
    (addr, cancel, thread::spawn(move || server.serve()))
}

/// Receive until a packet of the wanted kind arrives; `None` on timeout.
fn recv_until(socket: &UdpSocket, wanted: fn(&Message) -> bool) -> Option<(SocketAddr, Message)> {
    let mut buf = vec![0u8; DATA_PACKET_LEN + 1];
    loop {
        let (len, from) = socket.recv_from(&mut buf).ok()?;
        if let Ok((_, msg)) = parse(&buf[..len]) {
            if wanted(&msg) {
                return Some((from, msg));
            }
        }
    }
}

fn expected_stream(packets: u32) -> Vec<u8> {
    let source = SyntheticSource::new(packets);
    (1..=packets).flat_map(|seq| source.chunk(seq).to_vec()).collect()
}

#[test]
fn synthetic_stream_arrives_intact() {
    let config = test_config();
    let dir = scratch_dir("intact");
    let catalogs = (0..SOURCE_COUNT)
        .map(|_| Catalog::new(&dir, Vec::new(), PACKETS))
        .collect();
    let sources = Sources::spawn(&config, catalogs);

    let client = ClientSession::bind("127.0.0.1:0".parse().unwrap(), sources.addrs, config).unwrap();
    let (report, output) = client.run(TEST_FILENAME, Vec::new()).unwrap();

    assert_eq!(report.state, SessionState::Closed);
    assert!(!report.cancelled);
    assert_eq!(report.active_sources, [true; SOURCE_COUNT]);
    assert_eq!(report.stream.unwrap().total_packets, PACKETS);
    assert_eq!(report.buffer.flushed, u64::from(PACKETS));
    assert_eq!(output.len(), PACKETS as usize * DATA_LEN);
    assert!(output == expected_stream(PACKETS), "output differs from the source stream");
    // equal split: every source contributed
    assert!(report.packets_per_source.iter().all(|&n| n > 0));

    for result in sources.join() {
        let server = result.unwrap();
        assert!(matches!(
            server.outcome,
            ServerOutcome::ClientFinished | ServerOutcome::Completed
        ));
        assert!(server.packets_sent >= u64::from(PACKETS) / SOURCE_COUNT as u64);
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn refused_sources_are_covered_by_retransmission() {
    let config = test_config();
    let dir = scratch_dir("partial");
    let body: Vec<u8> = (0..40 * DATA_LEN + 123).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(dir.join("clip.bin"), &body).unwrap();

    // sources 2 and 3 do not carry the file
    let catalogs = (0..SOURCE_COUNT)
        .map(|id| {
            let files = if id < 2 { vec!["clip.bin".to_string()] } else { Vec::new() };
            Catalog::new(&dir, files, PACKETS)
        })
        .collect();
    let sources = Sources::spawn(&config, catalogs);

    let client = ClientSession::bind("127.0.0.1:0".parse().unwrap(), sources.addrs, config).unwrap();
    let (report, output) = client.run("clip.bin", Vec::new()).unwrap();

    assert_eq!(report.active_sources, [true, true, false, false]);
    assert_eq!(report.packets_per_source[2], 0);
    assert_eq!(report.packets_per_source[3], 0);
    // the shares of the refused sources had to be requested again
    assert!(report.naks_sent > 0);
    // padding of the last chunk is cut
    assert!(output == body, "reassembled file differs");

    let results = sources.cancel_and_join();
    for (id, result) in results.into_iter().enumerate() {
        let server = result.unwrap();
        if id < 2 {
            assert!(server.retransmits > 0 || server.packets_sent > 0);
        } else {
            assert_eq!(server.outcome, ServerOutcome::Cancelled);
        }
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn all_sources_refusing_fails_the_session() {
    let mut config = test_config();
    config.session.recv_timeout = Duration::from_millis(100);
    let dir = scratch_dir("refused");
    let catalogs = (0..SOURCE_COUNT)
        .map(|_| Catalog::new(&dir, Vec::new(), PACKETS))
        .collect();
    let sources = Sources::spawn(&config, catalogs);

    let client = ClientSession::bind("127.0.0.1:0".parse().unwrap(), sources.addrs, config).unwrap();
    let err = client.run("missing.bin", Vec::new()).unwrap_err();
    assert!(matches!(err, SessionError::AllRefused(ref name) if name == "missing.bin"));

    for result in sources.cancel_and_join() {
        assert_eq!(result.unwrap().outcome, ServerOutcome::Cancelled);
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cancelled_client_stops_the_sources() {
    let mut config = test_config();
    config.server.synthetic_packets = 1_000_000;
    config.rate.max_kbps = 1_000;
    let dir = scratch_dir("cancel");
    let catalogs = (0..SOURCE_COUNT)
        .map(|_| Catalog::new(&dir, Vec::new(), 1_000_000))
        .collect();
    let sources = Sources::spawn(&config, catalogs);

    let client = ClientSession::bind("127.0.0.1:0".parse().unwrap(), sources.addrs, config).unwrap();
    let cancel = client.cancel_token();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        cancel.store(true, Ordering::Relaxed);
    });
    let (report, _) = client.run(TEST_FILENAME, Vec::new()).unwrap();
    stopper.join().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.state, SessionState::Closed);
    assert!(report.packets_received > 0);
    assert!(report.buffer.flushed < 1_000_000);

    for result in sources.join() {
        assert_eq!(result.unwrap().outcome, ServerOutcome::ClientFinished);
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn source_fail_ends_the_session() {
    let mut config = test_config();
    config.server.synthetic_packets = 1_000_000;
    config.rate.max_kbps = 1_000;
    let dir = scratch_dir("peer-fail");

    let mut servers = Vec::new();
    let mut handles = Vec::new();
    for id in 0..3u8 {
        let (addr, _, handle) = spawn_server(&config, id, Catalog::new(&dir, Vec::new(), 1_000_000));
        servers.push(addr);
        handles.push(handle);
    }

    // Source 3 accepts the request, then gives up.
    let failing = UdpSocket::bind("127.0.0.1:0").unwrap();
    failing.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    servers.push(failing.local_addr().unwrap());
    let failing_source = thread::spawn(move || {
        let (client, _) = recv_until(&failing, |m| matches!(m, Message::Request { .. })).unwrap();
        let info = StreamInfo::for_len(1_000_000 * DATA_LEN as u64);
        let ack = Message::RequestAck(info).encode(3, CLIENT_ID).unwrap();
        failing.send_to(&ack, client).unwrap();
        thread::sleep(Duration::from_millis(200));
        let fail = Message::Fail.encode(3, CLIENT_ID).unwrap();
        failing.send_to(&fail, client).unwrap();
        recv_until(&failing, |m| *m == Message::Fin).is_some()
    });

    let client = ClientSession::bind(
        "127.0.0.1:0".parse().unwrap(),
        servers.try_into().unwrap(),
        config,
    )
    .unwrap();
    let err = client.run(TEST_FILENAME, Vec::new()).unwrap_err();
    assert!(matches!(err, SessionError::PeerTerminated(3)), "got {err}");

    // the client said goodbye to everyone, the failed source included
    assert!(failing_source.join().unwrap());
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap().outcome, ServerOutcome::ClientFinished);
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn server_gives_up_after_consecutive_bad_datagrams() {
    let mut config = test_config();
    config.server.synthetic_packets = 8;
    config.session.max_consecutive_errors = 3;
    // long enough that only the error budget can end the linger
    config.session.fin_grace = Duration::from_secs(10);
    let dir = scratch_dir("budget");
    let (server, _, handle) = spawn_server(&config, 0, Catalog::new(&dir, Vec::new(), 8));

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let request = Message::Request {
        filename: TEST_FILENAME.to_string(),
    }
    .encode(CLIENT_ID, 0)
    .unwrap();
    client.send_to(&request, server).unwrap();

    // source 0 owns 1 and 5 of 8, then lingers after FIN
    assert!(recv_until(&client, |m| *m == Message::Fin).is_some());
    for _ in 0..3 {
        client.send_to(&[0xff; 10], server).unwrap();
    }
    assert!(recv_until(&client, |m| *m == Message::Fail).is_some());

    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, SessionError::ErrorBudgetExhausted(3)), "got {err}");
    let _ = std::fs::remove_dir_all(&dir);
}
