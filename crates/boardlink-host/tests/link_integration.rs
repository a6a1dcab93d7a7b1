//! Integration tests for the device link.
//!
//! # Purpose
//!
//! These tests drive `ConnectionManager` through its public API over real
//! loopback sockets.  A "device" is simply a `TcpStream` owned by the test
//! that writes the handshake frame and reads whatever the host sends.
//!
//! ```text
//! Test (device side)                   ConnectionManager
//! ──────────────────                   ─────────────────
//!                                      start()  (accept loop)
//! connect()                      ──►   CONNECTED, incoming worker
//! write handshake frame          ──►   VERIFIED, outgoing worker
//! read frames                    ◄──   send(packet)
//! close                          ──►   DISCONNECTED, listener stays open
//! ```
//!
//! Each test binds port 0 on 127.0.0.1 and asks the manager for the real port,
//! so tests can run in parallel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use boardlink_core::protocol::{decode_frame, ProtocolError, FRAME_HEADER_SIZE, MAX_PAYLOAD_LEN};
use boardlink_core::{encode_frame, ConnectionState, DeviceIdentity, Frame, OutgoingPacket};
use boardlink_host::{AcceptOutcome, ConnectionManager, LinkConfig, LinkError, ListenerManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(3);

// ── Test fixtures ─────────────────────────────────────────────────────────────

/// A `ListenerManager` that records every callback.
#[derive(Default)]
struct Recorder {
    resets: Mutex<usize>,
    states: Mutex<Vec<ConnectionState>>,
    verified: Mutex<Vec<DeviceIdentity>>,
    packets: Mutex<Vec<Frame>>,
    errors: Mutex<Vec<String>>,
}

impl ListenerManager for Recorder {
    fn reset_listeners(&self) {
        *self.resets.lock().unwrap() += 1;
    }

    fn on_state_changed(&self, state: ConnectionState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_device_verified(&self, identity: &DeviceIdentity) {
        self.verified.lock().unwrap().push(identity.clone());
    }

    fn on_packet(&self, frame: &Frame) {
        self.packets.lock().unwrap().push(frame.clone());
    }

    fn on_link_error(&self, error: &LinkError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

fn identity() -> DeviceIdentity {
    DeviceIdentity {
        hardware_id: "SPRK0016".to_string(),
        bootloader_id: "IOIO0400".to_string(),
        firmware_id: "IOIO0500".to_string(),
    }
}

fn packet(opcode: u8, payload: &[u8]) -> OutgoingPacket {
    OutgoingPacket::new(opcode, payload.to_vec()).unwrap()
}

async fn bound_manager() -> (ConnectionManager, Arc<Recorder>, SocketAddr) {
    bound_manager_with_grace(500).await
}

async fn bound_manager_with_grace(
    halt_grace_ms: u64,
) -> (ConnectionManager, Arc<Recorder>, SocketAddr) {
    let config = LinkConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        accept_timeout_ms: 50,
        halt_grace_ms,
    };
    let recorder = Arc::new(Recorder::default());
    let manager = ConnectionManager::new(config, recorder.clone());
    let addr = manager.bind().await.expect("bind loopback");
    (manager, recorder, addr)
}

/// Runs `start()` in the background, connects a device and waits for the
/// accept to complete.
async fn connect_device(manager: &ConnectionManager, addr: SocketAddr) -> TcpStream {
    let accepting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start().await }
    });
    let device = TcpStream::connect(addr).await.expect("device connect");
    let outcome = tokio::time::timeout(WAIT, accepting)
        .await
        .expect("accept must complete")
        .expect("start task panicked")
        .expect("start failed");
    assert!(matches!(outcome, AcceptOutcome::Connected(_)));
    device
}

async fn handshake(device: &mut TcpStream) {
    let bytes = encode_frame(&identity().to_frame()).unwrap();
    device.write_all(&bytes).await.expect("write handshake");
}

async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    let mut rx = manager.subscribe();
    tokio::time::timeout(WAIT, async {
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            rx.changed().await.expect("manager dropped");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {target}"));
}

async fn read_frame(device: &mut TcpStream) -> Frame {
    tokio::time::timeout(WAIT, async {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        device.read_exact(&mut header).await.expect("frame header");
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut payload = vec![0u8; len];
        device.read_exact(&mut payload).await.expect("frame payload");
        Frame::new(header[0], payload)
    })
    .await
    .expect("no frame arrived")
}

async fn connect_and_verify(manager: &ConnectionManager, addr: SocketAddr) -> TcpStream {
    let mut device = connect_device(manager, addr).await;
    handshake(&mut device).await;
    wait_for_state(manager, ConnectionState::Verified).await;
    device
}

/// Polls `cond` until it holds or `WAIT` elapses.
async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Queues enough maximum-size frames to fill every socket buffer between
/// the host and a device that is not reading.
fn flood(manager: &ConnectionManager, count: usize) {
    for _ in 0..count {
        manager.send(packet(BULK, &vec![0xAB; MAX_PAYLOAD_LEN]));
    }
}

const BULK: u8 = 0x40;
const MARK: u8 = 0x7E;
const FLOOD: usize = 400;

async fn teardown(manager: &ConnectionManager) {
    manager.disconnect().await;
    tokio::time::timeout(WAIT, manager.join())
        .await
        .expect("join must return after disconnect");
}

// ── Accept loop ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_no_peer_keeps_manager_disconnected_while_retrying() {
    // Arrange
    let (manager, recorder, _addr) = bound_manager().await;

    // Act – let several 50 ms accept timeouts pass
    let accepting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start().await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Assert
    assert!(!accepting.is_finished(), "accept loop must keep retrying");
    assert!(!manager.is_connected());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(*recorder.resets.lock().unwrap(), 1);

    manager.disconnect().await;
    let outcome = tokio::time::timeout(WAIT, accepting).await.unwrap().unwrap();
    assert!(matches!(outcome, Ok(AcceptOutcome::Disconnected)));
    assert!(recorder.errors.lock().unwrap().is_empty());
}

// ── Verification and sending ──────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_verifies_device_and_packets_flow() {
    // Arrange
    let (manager, recorder, addr) = bound_manager().await;
    let mut device = connect_device(&manager, addr).await;
    assert!(manager.is_connected());
    assert!(!manager.is_verified());

    // Act
    handshake(&mut device).await;
    wait_for_state(&manager, ConnectionState::Verified).await;
    manager.send(packet(0x21, &[0x01, 0x02]));

    // Assert
    assert!(manager.is_verified());
    assert_eq!(read_frame(&mut device).await, Frame::new(0x21, vec![0x01, 0x02]));

    teardown(&manager).await;
    assert_eq!(*recorder.verified.lock().unwrap(), vec![identity()]);
    assert_eq!(
        *recorder.states.lock().unwrap(),
        vec![
            ConnectionState::Connected,
            ConnectionState::Verified,
            ConnectionState::Disconnected
        ]
    );
}

#[tokio::test]
async fn test_packets_sent_before_verification_are_discarded() {
    // Arrange – queued while nothing is connected
    let (manager, _recorder, addr) = bound_manager().await;
    manager.send(packet(0x0A, b"stale"));

    // Act
    let mut device = connect_and_verify(&manager, addr).await;
    manager.send(packet(0x0B, b"fresh"));

    // Assert – the first frame the device sees is the one sent after VERIFIED
    assert_eq!(read_frame(&mut device).await, Frame::new(0x0B, b"fresh".to_vec()));

    teardown(&manager).await;
}

#[tokio::test]
async fn test_packets_are_delivered_in_send_order() {
    // Arrange
    let (manager, _recorder, addr) = bound_manager().await;
    let mut device = connect_and_verify(&manager, addr).await;

    // Act
    for i in 0..50u8 {
        manager.send(packet(0x40, &[i]));
    }

    // Assert
    for i in 0..50u8 {
        assert_eq!(read_frame(&mut device).await.payload, vec![i]);
    }

    teardown(&manager).await;
}

#[tokio::test]
async fn test_send_from_plain_threads_is_delivered() {
    // Arrange
    let (manager, _recorder, addr) = bound_manager().await;
    let mut device = connect_and_verify(&manager, addr).await;

    // Act
    let senders: Vec<_> = (0..4u8)
        .map(|t| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    manager.send(packet(0x50 + t, &[t]));
                }
            })
        })
        .collect();
    for s in senders {
        s.join().unwrap();
    }

    // Assert
    let mut per_thread = [0usize; 4];
    for _ in 0..40 {
        let frame = read_frame(&mut device).await;
        per_thread[(frame.opcode - 0x50) as usize] += 1;
    }
    assert_eq!(per_thread, [10; 4]);

    teardown(&manager).await;
}

#[tokio::test]
async fn test_frames_from_verified_device_reach_listeners() {
    // Arrange
    let (manager, recorder, addr) = bound_manager().await;
    let mut device = connect_and_verify(&manager, addr).await;

    // Act
    let bytes = encode_frame(&Frame::new(0x30, vec![9, 8, 7])).unwrap();
    device.write_all(&bytes).await.unwrap();
    device.shutdown().await.unwrap();
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();

    // Assert
    assert_eq!(
        *recorder.packets.lock().unwrap(),
        vec![Frame::new(0x30, vec![9, 8, 7])]
    );
    teardown(&manager).await;
}

#[tokio::test]
async fn test_repeated_handshake_restarts_outgoing_and_clears_queue() {
    // Arrange – the device stops reading, so the outgoing worker blocks
    // inside a write with most of the flood still queued
    let (manager, recorder, addr) = bound_manager_with_grace(3000).await;
    let mut device = connect_and_verify(&manager, addr).await;
    flood(&manager, FLOOD);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Act – handshake again, then resume reading while the old worker
    // finishes the frame it is writing
    handshake(&mut device).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (mut reader, _writer) = device.into_split();
    let reading = tokio::spawn(async move {
        let mut bulk = 0usize;
        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            reader.read_exact(&mut header).await.expect("frame header");
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await.expect("frame payload");
            match header[0] {
                BULK => {
                    assert_eq!(len, MAX_PAYLOAD_LEN, "bulk frame was cut short");
                    bulk += 1;
                }
                MARK => return (bulk, payload),
                other => panic!("unexpected opcode {other:#04x}"),
            }
        }
    });
    eventually("second verification", || recorder.verified.lock().unwrap().len() == 2).await;
    manager.send(packet(MARK, b"after"));

    // Assert – the frame stream is intact, the backlog was cleared and the
    // packet sent after the second handshake arrives
    let (bulk, mark) = tokio::time::timeout(Duration::from_secs(10), reading)
        .await
        .expect("mark frame never arrived")
        .expect("reader panicked");
    assert_eq!(mark, b"after".to_vec());
    assert!(bulk < FLOOD, "queued frames must be discarded on re-verification, got {bulk}");
    assert!(manager.is_verified());
    assert!(recorder.errors.lock().unwrap().is_empty());

    teardown(&manager).await;
}

#[tokio::test]
async fn test_stuck_writer_on_repeated_handshake_closes_connection() {
    // Arrange – a device that never reads, and a short halt grace period
    let (manager, recorder, addr) = bound_manager_with_grace(100).await;
    let mut device = connect_and_verify(&manager, addr).await;
    flood(&manager, FLOOD);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Act – the old worker cannot finish its frame before the grace period
    handshake(&mut device).await;
    manager.send(packet(MARK, b"after"));
    wait_for_state(&manager, ConnectionState::Disconnected).await;

    // Assert – the link was closed rather than reused after a partial frame
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, device.read_to_end(&mut received))
        .await
        .expect("device must see the connection close")
        .expect("read until close");
    let mut rest = &received[..];
    loop {
        match decode_frame(rest) {
            Ok((frame, consumed)) => {
                assert_eq!(frame.opcode, BULK, "no frame may follow a truncated one");
                rest = &rest[consumed..];
            }
            Err(ProtocolError::InsufficientData { .. }) => break,
            Err(e) => panic!("device stream is out of sync: {e}"),
        }
    }
    assert!(rest.len() < FRAME_HEADER_SIZE + MAX_PAYLOAD_LEN);
    assert_eq!(recorder.verified.lock().unwrap().len(), 1);
    let errors = recorder.errors.lock().unwrap().clone();
    assert!(errors.iter().any(|e| e.contains("write")), "got: {errors:?}");

    teardown(&manager).await;
}

// ── Shutdown paths ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peer_close_returns_to_disconnected_and_keeps_listening() {
    // Arrange
    let (manager, recorder, addr) = bound_manager().await;
    let device = connect_and_verify(&manager, addr).await;

    // Act
    drop(device);
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    tokio::time::timeout(WAIT, manager.join())
        .await
        .expect("both workers must halt after the peer closed");

    // Assert – the endpoint is still open and a second device can verify
    assert_eq!(manager.local_addr().await, Some(addr));
    assert!(
        recorder.errors.lock().unwrap().is_empty(),
        "a clean close is not an error"
    );
    let mut second = connect_and_verify(&manager, addr).await;
    manager.send(packet(0x01, &[1]));
    assert_eq!(read_frame(&mut second).await.opcode, 0x01);
    assert_eq!(*recorder.resets.lock().unwrap(), 2);

    teardown(&manager).await;
}

#[tokio::test]
async fn test_data_before_handshake_is_reported_and_disconnects() {
    // Arrange
    let (manager, recorder, addr) = bound_manager().await;
    let mut device = connect_device(&manager, addr).await;

    // Act
    let bytes = encode_frame(&Frame::new(0x21, vec![1])).unwrap();
    device.write_all(&bytes).await.unwrap();
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();

    // Assert
    let errors = recorder.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1, "got: {errors:?}");
    assert!(errors[0].contains("read"), "got: {errors:?}");
    assert!(!recorder.states.lock().unwrap().contains(&ConnectionState::Verified));

    teardown(&manager).await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_closes_everything() {
    // Arrange
    let (manager, _recorder, addr) = bound_manager().await;
    let mut device = connect_and_verify(&manager, addr).await;

    // Act
    manager.disconnect().await;
    manager.disconnect().await;
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();

    // Assert
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.local_addr().await.is_none());
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(WAIT, device.read(&mut buf))
        .await
        .expect("device must observe the close")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(matches!(
        manager.start().await,
        Ok(AcceptOutcome::Disconnected)
    ));
    assert!(matches!(manager.bind().await, Err(LinkError::Closed)));
}

#[tokio::test]
async fn test_join_returns_immediately_when_nothing_started() {
    let (manager, _recorder, _addr) = bound_manager().await;
    tokio::time::timeout(Duration::from_millis(100), manager.join())
        .await
        .expect("join must not block");
}

#[tokio::test]
async fn test_run_serves_devices_until_disconnect() {
    // Arrange
    let (manager, recorder, addr) = bound_manager().await;
    let service = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run().await }
    });

    // Act – two devices, one after the other
    for _ in 0..2 {
        let mut device = TcpStream::connect(addr).await.unwrap();
        handshake(&mut device).await;
        wait_for_state(&manager, ConnectionState::Verified).await;
        drop(device);
        wait_for_state(&manager, ConnectionState::Disconnected).await;
    }
    manager.disconnect().await;

    // Assert
    let result = tokio::time::timeout(WAIT, service).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(recorder.verified.lock().unwrap().len(), 2);
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();
}
