//! Coordinator-side control plane: session acceptance and message routing.
//!
//! One task per session. The handshake must be a `hello` within the
//! handshake timeout; afterwards the session loop multiplexes incoming
//! frames, the outbound fan-out queue and the heartbeat cadence. Errors
//! answer the sender with an `error` message; only fatal ones close the
//! session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bootstrap::CoreServices;
use crate::error::TempoError;
use crate::events::SessionEvent;
use crate::net::{framed, send_frame, ControlSink, ControlStream};
use crate::protocol::{
    check_protocol_version, known_capabilities, Capability, Envelope, Message, NodeRole,
};
use crate::protocol_constants::{FANOUT_CHANNEL_CAPACITY, HEARTBEAT_MISS_LIMIT, PROTOCOL_VERSION};
use crate::services::SessionLimits;
use crate::services::session_store::handle_for;
use crate::utils::{monotonic_secs, now_millis};

/// Time allowed for the opening `hello` to arrive.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts control-plane connections until cancelled.
pub async fn run_control_listener(
    services: Arc<CoreServices>,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    log::info!(
        "[Control] Listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string())
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[Control] Listener stopped");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let services = Arc::clone(&services);
                        let session_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            handle_session(services, stream, addr, session_cancel).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("[Control] Accept failed: {e}");
                    }
                }
            }
        }
    }
}

/// Runs one session from accept to teardown.
async fn handle_session(
    services: Arc<CoreServices>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = framed(stream).split();

    // Session budget per source address, released by the permit's Drop.
    let Some(_permit) = services.budget.try_register(addr.ip()) else {
        log::warn!("[Control] Session budget exhausted for {}", addr.ip());
        let err = TempoError::RateLimited(format!("too many sessions from {}", addr.ip()));
        let envelope = services.envelope(Message::from_error(&err));
        let _ = send_frame(&mut sink, &envelope).await;
        return;
    };

    let hello = match await_hello(&services, &mut sink, &mut stream).await {
        Some(hello) => hello,
        None => return,
    };

    let session_id = format!("sess-{}", Uuid::new_v4().simple());
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(FANOUT_CHANNEL_CAPACITY);
    services.sessions.insert(handle_for(
        &session_id,
        &hello.node_id,
        hello.role,
        hello.capabilities.clone(),
        &addr.to_string(),
        outbound_tx,
    ));
    services.emitter.emit_session(SessionEvent::Opened {
        session_id: session_id.clone(),
        node_id: hello.node_id.clone(),
        timestamp: now_millis(),
    });

    // Server hello carries the cluster view so clients can re-bind later.
    let reply = services.envelope(Message::Hello {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: vec![
            Capability::Audio.as_str().to_string(),
            Capability::Video.as_str().to_string(),
            Capability::ClockSync.as_str().to_string(),
            Capability::Cluster.as_str().to_string(),
        ],
        node_type: services.cluster.role(),
        auth_token: None,
        cluster_info: Some(services.cluster.registry.cluster_info()),
    });
    if send_frame(&mut sink, &reply).await.is_err() {
        services.sessions.remove(&session_id);
        return;
    }

    let limits = SessionLimits::new();
    let heartbeat = Duration::from_secs(services.config.heartbeat_interval_secs);
    let mut heartbeat_ticker = interval(heartbeat);
    heartbeat_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[Control] Session {session_id} cancelled");
                break;
            }
            incoming = stream.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        log::debug!("[Control] Session {session_id} read error: {e}");
                        break;
                    }
                    None => break,
                };
                last_heard = Instant::now();
                let keep_open =
                    dispatch_frame(&services, &session_id, &limits, &frame, &mut sink).await;
                if !keep_open {
                    break;
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        if send_frame(&mut sink, &envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat_ticker.tick() => {
                if last_heard.elapsed() > heartbeat * HEARTBEAT_MISS_LIMIT {
                    log::warn!(
                        "[Control] Session {session_id} missed {HEARTBEAT_MISS_LIMIT} heartbeats, closing"
                    );
                    break;
                }
                let ping = services.envelope(Message::Heartbeat {
                    client_time: services.clock.now(),
                    server_time: None,
                });
                if send_frame(&mut sink, &ping).await.is_err() {
                    break;
                }
            }
        }
    }

    // Teardown: drop the session and any cluster knowledge tied to it.
    services.sessions.remove(&session_id);
    if hello.role == NodeRole::Replica {
        services.cluster.registry.forget(&hello.node_id);
    }
    services.emitter.emit_session(SessionEvent::Closed {
        session_id,
        timestamp: now_millis(),
    });
}

/// Peer identity established by the handshake.
struct HelloOutcome {
    node_id: String,
    role: NodeRole,
    capabilities: Vec<Capability>,
}

/// Waits for the opening `hello` and validates it. On failure an `error`
/// is sent and `None` returned, which closes the session.
async fn await_hello(
    services: &CoreServices,
    sink: &mut ControlSink,
    stream: &mut ControlStream,
) -> Option<HelloOutcome> {
    let first = match timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => {
            log::debug!("[Control] Handshake read error: {e}");
            return None;
        }
        Ok(None) => return None,
        Err(_) => {
            log::debug!("[Control] Handshake timed out");
            return None;
        }
    };

    let envelope = match Envelope::parse(&first) {
        Ok(envelope) => envelope,
        Err(err) => {
            let reply = services.envelope(Message::from_error(&err));
            let _ = send_frame(sink, &reply).await;
            return None;
        }
    };

    let Message::Hello {
        ref protocol_version,
        ref capabilities,
        node_type,
        ref auth_token,
        ..
    } = envelope.body
    else {
        let err = TempoError::InvalidState("session must open with hello".to_string());
        let reply = services.envelope(Message::from_error(&err));
        let _ = send_frame(sink, &reply).await;
        return None;
    };

    if let Err(err) = check_protocol_version(protocol_version) {
        log::warn!(
            "[Control] Refusing {} ({protocol_version} vs {PROTOCOL_VERSION})",
            envelope.node_id
        );
        let reply = services.envelope(Message::from_error(&err));
        let _ = send_frame(sink, &reply).await;
        return None;
    }

    if let Some(expected) = &services.config.auth_token {
        if auth_token.as_deref() != Some(expected.as_str()) {
            let err = TempoError::AuthRejected("invalid or missing token".to_string());
            let reply = services.envelope(Message::from_error(&err));
            let _ = send_frame(sink, &reply).await;
            return None;
        }
    }

    Some(HelloOutcome {
        node_id: envelope.node_id,
        role: node_type,
        capabilities: known_capabilities(capabilities),
    })
}

/// Handles one post-handshake frame. Returns `false` when the session must
/// close.
async fn dispatch_frame(
    services: &Arc<CoreServices>,
    session_id: &str,
    limits: &SessionLimits,
    frame: &str,
    sink: &mut ControlSink,
) -> bool {
    let envelope = match Envelope::parse(frame) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Unknown or malformed messages are answered, never dropped.
            let reply = services.envelope(Message::from_error(&err));
            return send_frame(sink, &reply).await.is_ok();
        }
    };

    match envelope.body {
        Message::Hello { .. } => {
            // Duplicate hello: refused, session state intact.
            let err = TempoError::InvalidState("session already established".to_string());
            let reply = services.envelope(Message::from_error(&err));
            send_frame(sink, &reply).await.is_ok()
        }
        Message::ClockSync { t1 } => {
            if !limits.allow_probe() {
                services.emitter.emit_session(SessionEvent::RateLimited {
                    session_id: session_id.to_string(),
                    timestamp: now_millis(),
                });
                let err = TempoError::RateLimited("clock_sync budget exceeded".to_string());
                let reply = services.envelope(Message::from_error(&err));
                return send_frame(sink, &reply).await.is_ok();
            }
            let t2 = services.clock.now();
            let t3 = services.clock.now();
            let reply = services.envelope(Message::ClockSyncResponse { t1, t2, t3 });
            send_frame(sink, &reply).await.is_ok()
        }
        Message::Heartbeat {
            client_time,
            server_time,
        } => {
            if server_time.is_some() {
                // Reply to our own ping; liveness already noted.
                return true;
            }
            let reply = services.envelope(Message::Heartbeat {
                client_time,
                server_time: Some(services.clock.now()),
            });
            send_frame(sink, &reply).await.is_ok()
        }
        Message::MediaControl { .. } => {
            if !limits.allow_command() {
                services.emitter.emit_session(SessionEvent::RateLimited {
                    session_id: session_id.to_string(),
                    timestamp: now_millis(),
                });
                let err = TempoError::RateLimited("media_control budget exceeded".to_string());
                let reply = services.envelope(Message::from_error(&err));
                return send_frame(sink, &reply).await.is_ok();
            }
            match services.router.route(&envelope, session_id) {
                Ok(_) => true,
                Err(err) => {
                    let reply = services.envelope(Message::from_error(&err));
                    send_frame(sink, &reply).await.is_ok()
                }
            }
        }
        Message::MediaData { .. } => {
            services
                .sessions
                .fan_out(&envelope, NodeRole::Client, session_id);
            true
        }
        Message::NodeStatus(ref info) => {
            services
                .cluster
                .registry
                .observe_status(&envelope.node_id, info.clone());
            if info.role == NodeRole::Master {
                let now = monotonic_secs();
                let mut engine = services.cluster.engine.lock();
                let term = engine.term();
                let actions = engine.on_master_seen(&envelope.node_id, term, now);
                drop(engine);
                services.apply_election_actions(actions);
            }
            true
        }
        Message::MasterElection {
            term,
            candidate_score,
            ..
        } => {
            let actions = services.cluster.engine.lock().on_claim(
                &envelope.node_id,
                term,
                candidate_score,
                monotonic_secs(),
            );
            services.apply_election_actions(actions);
            true
        }
        Message::ClockSyncResponse { .. } => {
            log::debug!("[Control] Unexpected clock_sync_response from {session_id}");
            true
        }
        Message::Error { code, ref message, .. } => {
            log::warn!("[Control] Peer error on {session_id}: {code} {message}");
            true
        }
    }
}
