//! End-to-end tests driving a real coordinator and endpoint over localhost
//! TCP: handshake, clock-sync probes, scheduled playback fan-out, replay
//! suppression and probe rate limiting.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::codec::{Framed, LinesCodec};

use tempocast_core::net::server::run_control_listener;
use tempocast_core::protocol_constants::{PROBE_RATE_LIMIT, PROTOCOL_VERSION};
use tempocast_core::{
    bootstrap_services, bootstrap_services_with_renderer, Config, ControlParams, CoreServices,
    Envelope, MediaAction, MediaCodec, MediaFrame, Message, NodeRole, Renderer,
};

/// Renderer that records released frames for assertions.
struct RecordingRenderer {
    submitted: Mutex<Vec<(String, u64)>>,
}

impl RecordingRenderer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submitted: Mutex::new(Vec::new()),
        })
    }

    fn released(&self) -> Vec<(String, u64)> {
        self.submitted.lock().clone()
    }
}

impl Renderer for RecordingRenderer {
    fn submit(&self, frame: &MediaFrame, _deadline_local: f64) {
        self.submitted
            .lock()
            .push((frame.track_id.clone(), frame.sequence));
    }

    fn stop(&self, _track_id: &str) {}

    fn now_local(&self) -> f64 {
        tempocast_core::monotonic_secs()
    }
}

/// Starts a master coordinator on an ephemeral port. The clock is reset to
/// the bare process monotonic timescale so endpoint offsets converge
/// instantly in-test; offset convergence itself is covered by clock units.
async fn start_master(node_id: &str) -> (Arc<CoreServices>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    let services = bootstrap_services(Config {
        node_id: node_id.to_string(),
        role: NodeRole::Master,
        ..Config::default()
    });
    services.clock.reset();
    services.start_background_tasks();
    tokio::spawn(run_control_listener(
        services.clone(),
        listener,
        services.cancel_token(),
    ));
    (services, addr)
}

/// Starts an endpoint bound to the given coordinator address.
fn start_endpoint(
    node_id: &str,
    server_addr: &str,
    renderer: Arc<RecordingRenderer>,
) -> Arc<CoreServices> {
    let services = bootstrap_services_with_renderer(
        Config {
            node_id: node_id.to_string(),
            role: NodeRole::Client,
            peers: vec![server_addr.to_string()],
            // Fast probing, but under the server's 10/s probe budget.
            probe_interval_secs: 0.12,
            ..Config::default()
        },
        renderer,
    );
    services.start_background_tasks();
    services
}

/// Polls `condition` until it holds or the deadline passes.
async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn media_data_envelope(
    services: &CoreServices,
    track_id: &str,
    sequence: u64,
    presentation: f64,
) -> Envelope {
    let frame = MediaFrame {
        track_id: track_id.to_string(),
        sequence,
        presentation_ts: presentation,
        duration: 0.02,
        codec: MediaCodec::Pcm16,
        is_keyframe: sequence == 0,
        payload: Bytes::from_static(b"\x00\x01\x02\x03"),
    };
    services.envelope(Message::MediaData {
        track_id: frame.track_id.clone(),
        chunk_index: frame.sequence,
        timestamp: frame.presentation_ts,
        duration: frame.duration,
        codec: frame.codec,
        data: frame.encode_payload(),
        is_keyframe: frame.is_keyframe,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endpoint_syncs_schedules_and_renders_once() {
    let (master, addr) = start_master("master-1").await;
    let renderer = RecordingRenderer::new();
    let endpoint = start_endpoint("endpoint-1", &addr, Arc::clone(&renderer));

    // Handshake completes and probes start feeding the endpoint clock.
    wait_for("endpoint session", || master.sessions.count() == 1).await;
    wait_for("first clock sample", || endpoint.clock.sample_count() > 0).await;

    // Loopback link, shared monotonic base: clocks agree closely.
    let skew = (endpoint.clock.now() - master.clock.now()).abs();
    assert!(skew < 0.05, "clock skew {skew}s");

    // Schedule load + play, then stream two frames slightly ahead of them.
    let tau = master.clock.now();
    let load = master.envelope(Message::MediaControl {
        action: MediaAction::Load,
        track_id: "show".to_string(),
        start_at: tau + 0.15,
        params: ControlParams::default(),
    });
    let play = master.envelope(Message::MediaControl {
        action: MediaAction::Play,
        track_id: "show".to_string(),
        start_at: tau + 0.2,
        params: ControlParams {
            volume: Some(0.9),
            ..Default::default()
        },
    });
    assert_eq!(master.router.route(&load, "test").unwrap(), 1);
    assert_eq!(master.router.route(&play, "test").unwrap(), 1);

    for seq in 0..2u64 {
        let data = media_data_envelope(&master, "show", seq, tau + 0.3 + seq as f64 * 0.05);
        assert_eq!(master.sessions.fan_out(&data, NodeRole::Client, ""), 1);
    }

    wait_for("frames rendered", || renderer.released().len() == 2).await;
    assert_eq!(
        renderer.released(),
        vec![("show".to_string(), 0), ("show".to_string(), 1)]
    );

    // Replayed command id: accepted, not re-forwarded.
    assert_eq!(master.router.route(&play, "test").unwrap(), 0);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(renderer.released().len(), 2, "no duplicate emission");

    endpoint.shutdown().await;
    master.shutdown().await;
}

/// Opens a raw control connection and completes the handshake.
async fn raw_session(addr: &str, node_id: &str) -> Framed<TcpStream, LinesCodec> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(64 * 1024));

    let hello = Envelope::new(
        node_id,
        0,
        Message::Hello {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: vec!["audio".to_string(), "clock_sync".to_string()],
            node_type: NodeRole::Client,
            auth_token: None,
            cluster_info: None,
        },
    );
    framed.send(hello.to_frame().unwrap()).await.unwrap();

    let reply = timeout(Duration::from_secs(2), framed.next())
        .await
        .expect("hello reply in time")
        .expect("stream open")
        .expect("frame");
    let reply = Envelope::parse(&reply).unwrap();
    assert!(matches!(reply.body, Message::Hello { .. }));
    framed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_flood_is_rate_limited_but_session_survives() {
    let (master, addr) = start_master("master-2").await;
    let mut session = raw_session(&addr, "flooder").await;

    // Burst of 20 probes in well under a second.
    for i in 0..20u64 {
        let probe = Envelope::new("flooder", i + 1, Message::ClockSync { t1: i as f64 });
        session.send(probe.to_frame().unwrap()).await.unwrap();
    }

    let mut responses = 0;
    let mut rate_limited = 0;
    // Drain replies; server heartbeats may interleave, so read until both
    // counts are in or the stream stalls.
    while responses + rate_limited < 20 {
        let frame = match timeout(Duration::from_secs(2), session.next()).await {
            Ok(Some(Ok(frame))) => frame,
            _ => break,
        };
        match Envelope::parse(&frame).unwrap().body {
            Message::ClockSyncResponse { .. } => responses += 1,
            Message::Error { code, .. } if code == 1003 => rate_limited += 1,
            _ => {}
        }
    }

    assert_eq!(responses, PROBE_RATE_LIMIT, "first {PROBE_RATE_LIMIT} probes answered");
    assert_eq!(rate_limited, 20 - PROBE_RATE_LIMIT);

    // Session stays open: a heartbeat still gets answered.
    let beat = Envelope::new("flooder", 99, Message::Heartbeat {
        client_time: 1.0,
        server_time: None,
    });
    session.send(beat.to_frame().unwrap()).await.unwrap();
    let mut heartbeat_answered = false;
    for _ in 0..5 {
        let frame = match timeout(Duration::from_secs(2), session.next()).await {
            Ok(Some(Ok(frame))) => frame,
            _ => break,
        };
        if let Message::Heartbeat {
            client_time,
            server_time: Some(_),
        } = Envelope::parse(&frame).unwrap().body
        {
            assert_eq!(client_time, 1.0);
            heartbeat_answered = true;
            break;
        }
    }
    assert!(heartbeat_answered, "session should remain usable");

    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_hello_is_refused_but_session_survives() {
    let (master, addr) = start_master("master-4").await;
    let mut session = raw_session(&addr, "double-dipper").await;
    assert_eq!(master.sessions.count(), 1);

    let again = Envelope::new(
        "double-dipper",
        1,
        Message::Hello {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: vec![],
            node_type: NodeRole::Client,
            auth_token: None,
            cluster_info: None,
        },
    );
    session.send(again.to_frame().unwrap()).await.unwrap();

    let mut refused = false;
    for _ in 0..5 {
        let frame = match timeout(Duration::from_secs(2), session.next()).await {
            Ok(Some(Ok(frame))) => frame,
            _ => break,
        };
        if let Message::Error { code, .. } = Envelope::parse(&frame).unwrap().body {
            assert_eq!(code, 1005);
            refused = true;
            break;
        }
    }
    assert!(refused, "second hello should be refused with INVALID_STATE");

    // First session state is intact: still registered, probes still served.
    assert_eq!(master.sessions.count(), 1);
    let probe = Envelope::new("double-dipper", 2, Message::ClockSync { t1: 7.0 });
    session.send(probe.to_frame().unwrap()).await.unwrap();
    let mut answered = false;
    for _ in 0..5 {
        let frame = match timeout(Duration::from_secs(2), session.next()).await {
            Ok(Some(Ok(frame))) => frame,
            _ => break,
        };
        if let Message::ClockSyncResponse { t1, .. } = Envelope::parse(&frame).unwrap().body {
            assert_eq!(t1, 7.0);
            answered = true;
            break;
        }
    }
    assert!(answered, "probes should still be served after refused hello");

    master.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incompatible_protocol_version_is_refused() {
    let (master, addr) = start_master("master-3").await;
    let stream = TcpStream::connect(&addr).await.expect("connect");
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(64 * 1024));

    let hello = Envelope::new(
        "time-traveler",
        0,
        Message::Hello {
            protocol_version: "99.0.0".to_string(),
            capabilities: vec![],
            node_type: NodeRole::Client,
            auth_token: None,
            cluster_info: None,
        },
    );
    framed.send(hello.to_frame().unwrap()).await.unwrap();

    let reply = timeout(Duration::from_secs(2), framed.next())
        .await
        .expect("reply in time")
        .expect("stream open")
        .expect("frame");
    match Envelope::parse(&reply).unwrap().body {
        Message::Error { code, .. } => assert_eq!(code, 1001),
        other => panic!("expected version mismatch error, got {other:?}"),
    }

    // The server closes the session after refusing the handshake.
    let eof = timeout(Duration::from_secs(2), framed.next()).await;
    assert!(matches!(eof, Ok(None)), "connection should close");

    master.shutdown().await;
}
