//! Upstream control-plane link: endpoints and standby replicas.
//!
//! `run_link` owns the connection to the current master, re-binding on
//! failure: it probes known replicas in order of last-advertised score
//! (then configured peers), accepts only a node answering as master with a
//! term at least as new as the last seen, and replays commands buffered
//! during the outage. The disciplined clock is never reset across re-binds.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::CoreServices;
use crate::clock::SyncProbeDriver;
use crate::cluster::candidate_score;
use crate::error::{TempoError, TempoResult};
use crate::net::{framed, send_frame, ControlSink};
use crate::protocol::{
    check_protocol_version, Capability, Envelope, MediaFrame, Message, NodeRole, ScheduledAction,
};
use crate::protocol_constants::{FANOUT_CHANNEL_CAPACITY, HEARTBEAT_MISS_LIMIT, PROTOCOL_VERSION};
use crate::utils::monotonic_secs;

/// Time allowed for connect and for the server's `hello`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor/ceiling of the reconnect backoff.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// How one link session ended.
enum SessionEnd {
    Cancelled,
    Disconnected,
}

/// Maintains the upstream link until cancelled.
pub async fn run_link(services: Arc<CoreServices>, cancel: CancellationToken) {
    let mut backoff = BACKOFF_MIN;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        // A coordinator that won an election has no upstream to bind to.
        if services.config.role != NodeRole::Client
            && services.cluster.role() == NodeRole::Master
        {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(Duration::from_secs(1)) => continue,
            }
        }

        let targets = probe_targets(&services);
        if targets.is_empty() {
            log::warn!("[Link] No coordinator addresses known or configured");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(BACKOFF_MAX) => continue,
            }
        }

        let mut had_session = false;
        for addr in &targets {
            match run_session(&services, addr, &cancel).await {
                Ok(SessionEnd::Cancelled) => return,
                Ok(SessionEnd::Disconnected) => {
                    log::warn!("[Link] Lost {addr}, re-binding");
                    had_session = true;
                    break;
                }
                Err(e) => {
                    log::debug!("[Link] Probe of {addr} failed: {e}");
                }
            }
        }

        backoff = if had_session {
            BACKOFF_MIN
        } else {
            (backoff * 2).min(BACKOFF_MAX)
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
    }
}

/// Addresses to probe, best replica first, configured peers as fallback.
fn probe_targets(services: &CoreServices) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    {
        let book = services.addr_book.lock();
        let planner = services.planner.lock();
        for node_id in planner.probe_order() {
            if let Some(addr) = book.get(&node_id) {
                if !targets.contains(addr) {
                    targets.push(addr.clone());
                }
            }
        }
    }
    for peer in &services.config.peers {
        if !targets.contains(peer) {
            targets.push(peer.clone());
        }
    }
    targets
}

/// Capabilities advertised by this node's role.
fn own_capabilities(role: NodeRole) -> Vec<String> {
    let mut caps = vec![
        Capability::Audio.as_str().to_string(),
        Capability::ClockSync.as_str().to_string(),
    ];
    if role != NodeRole::Client {
        caps.push(Capability::Cluster.as_str().to_string());
    }
    caps
}

/// Connects to one coordinator and runs the session until it ends.
///
/// Returns `Err` when the peer is unreachable or not an acceptable master,
/// so the caller moves on to the next probe target.
async fn run_session(
    services: &Arc<CoreServices>,
    addr: &str,
    cancel: &CancellationToken,
) -> TempoResult<SessionEnd> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TempoError::TransportClosed(format!("connect to {addr} timed out")))?
        .map_err(|e| TempoError::TransportClosed(format!("connect to {addr}: {e}")))?;
    let (mut sink, mut incoming) = framed(stream).split();

    let link_role = if services.config.role == NodeRole::Client {
        NodeRole::Client
    } else {
        NodeRole::Replica
    };
    let hello = services.envelope(Message::Hello {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: own_capabilities(link_role),
        node_type: link_role,
        auth_token: services.config.auth_token.clone(),
        cluster_info: None,
    });
    send_frame(&mut sink, &hello).await?;

    // The server's hello tells us whether we found the master and carries
    // the replica set for future re-binds.
    let reply = match timeout(CONNECT_TIMEOUT, incoming.next()).await {
        Ok(Some(Ok(frame))) => Envelope::parse(&frame)?,
        Ok(Some(Err(e))) => return Err(TempoError::TransportClosed(e.to_string())),
        Ok(None) => return Err(TempoError::TransportClosed("closed during handshake".into())),
        Err(_) => return Err(TempoError::TransportClosed("handshake timed out".into())),
    };

    let replay = match reply.body {
        Message::Hello {
            ref protocol_version,
            node_type,
            ref cluster_info,
            ..
        } => {
            check_protocol_version(protocol_version)?;
            services
                .addr_book
                .lock()
                .insert(reply.node_id.clone(), addr.to_string());

            let mut planner = services.planner.lock();
            let term = cluster_info.as_ref().map_or(0, |info| info.term);
            if let Some(info) = cluster_info {
                planner.update_cluster_info(info);
            }
            match planner.try_accept(node_type, term) {
                Some(replay) => replay,
                None => {
                    return Err(TempoError::TransportClosed(format!(
                        "{} answered as {node_type:?} at term {term}, not an acceptable master",
                        reply.node_id
                    )));
                }
            }
        }
        Message::Error { code, ref message, .. } => {
            return Err(TempoError::TransportClosed(format!(
                "refused by {addr}: {code} {message}"
            )));
        }
        _ => {
            return Err(TempoError::InvalidState(
                "expected hello to open the session".to_string(),
            ));
        }
    };

    let master_id = reply.node_id.clone();
    log::info!("[Link] Bound to master {master_id} at {addr}");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(FANOUT_CHANNEL_CAPACITY);
    *services.peer_outbound.write() = Some(outbound_tx.clone());
    if !replay.is_empty() {
        log::info!("[Link] Replaying {} buffered command(s)", replay.len());
        for envelope in replay {
            let _ = outbound_tx.try_send(envelope);
        }
    }

    let link_cancel = cancel.child_token();
    let driver = Arc::new(SyncProbeDriver::new(
        services.clock.clone(),
        Arc::clone(&services.link_stats),
        outbound_tx.clone(),
        services.config.node_id.clone(),
        services.sequence_counter(),
        Duration::from_secs_f64(services.config.probe_interval_secs),
    ));
    tokio::spawn(Arc::clone(&driver).run(link_cancel.clone()));

    let heartbeat = Duration::from_secs(services.config.heartbeat_interval_secs);
    let mut heartbeat_ticker = interval(heartbeat);
    heartbeat_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            frame = incoming.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        log::debug!("[Link] Read error: {e}");
                        break SessionEnd::Disconnected;
                    }
                    None => break SessionEnd::Disconnected,
                };
                last_heard = Instant::now();
                handle_incoming(services, &driver, &master_id, &frame, &mut sink).await;
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        if send_frame(&mut sink, &envelope).await.is_err() {
                            break SessionEnd::Disconnected;
                        }
                    }
                    None => break SessionEnd::Disconnected,
                }
            }
            _ = heartbeat_ticker.tick() => {
                if last_heard.elapsed() > heartbeat * HEARTBEAT_MISS_LIMIT {
                    log::warn!("[Link] Master {master_id} unhealthy ({HEARTBEAT_MISS_LIMIT} heartbeats missed)");
                    break SessionEnd::Disconnected;
                }
                let ping = services.envelope(Message::Heartbeat {
                    client_time: monotonic_secs(),
                    server_time: None,
                });
                if send_frame(&mut sink, &ping).await.is_err() {
                    break SessionEnd::Disconnected;
                }
            }
        }
    };

    // Teardown: stop the probe driver, drop the link, flush the scheduler.
    // The disciplined clock keeps its estimate as a warm start.
    link_cancel.cancel();
    *services.peer_outbound.write() = None;
    if let Some(buffer) = &services.buffer {
        buffer.cancel_all();
    }
    Ok(end)
}

/// Handles one frame from the master.
async fn handle_incoming(
    services: &Arc<CoreServices>,
    driver: &SyncProbeDriver,
    master_id: &str,
    frame: &str,
    sink: &mut ControlSink,
) {
    let envelope = match Envelope::parse(frame) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::debug!("[Link] Unparseable frame from {master_id}: {err}");
            let reply = services.envelope(Message::from_error(&err));
            let _ = send_frame(sink, &reply).await;
            return;
        }
    };

    // Any traffic from the bound master counts as liveness for the
    // election timeout on coordinator nodes.
    if services.config.role != NodeRole::Client && envelope.node_id == master_id {
        let now = monotonic_secs();
        let mut engine = services.cluster.engine.lock();
        let term = engine.term();
        let actions = engine.on_master_seen(master_id, term, now);
        drop(engine);
        services.apply_election_actions(actions);
    }

    match envelope.body {
        Message::ClockSyncResponse { t1, t2, t3 } => {
            driver.on_response(t1, t2, t3);
        }
        Message::Heartbeat {
            client_time,
            server_time: Some(server_time),
        } => {
            driver.on_heartbeat_reply(client_time, server_time);
        }
        Message::Heartbeat {
            client_time,
            server_time: None,
        } => {
            let reply = services.envelope(Message::Heartbeat {
                client_time,
                server_time: Some(services.clock.now()),
            });
            let _ = send_frame(sink, &reply).await;
        }
        Message::MediaControl {
            action,
            ref track_id,
            start_at,
            ref params,
        } => {
            let Some(buffer) = &services.buffer else {
                return;
            };
            let scheduled = ScheduledAction {
                id: envelope.id.clone(),
                sequence: envelope.sequence,
                action,
                track_id: track_id.clone(),
                start_at,
                params: params.clone(),
            };
            if let Err(err) = buffer.submit_action(scheduled) {
                // TOO_LATE and invalid params go back to the originator.
                let reply = services.envelope(Message::from_error(&err));
                let _ = send_frame(sink, &reply).await;
            }
        }
        Message::MediaData {
            ref track_id,
            chunk_index,
            timestamp,
            duration,
            codec,
            ref data,
            is_keyframe,
        } => {
            let Some(buffer) = &services.buffer else {
                return;
            };
            match MediaFrame::from_wire(
                track_id.clone(),
                chunk_index,
                timestamp,
                duration,
                codec,
                data,
                is_keyframe,
            ) {
                Ok(frame) => {
                    buffer.admit_frame(frame);
                }
                Err(err) => {
                    // Malformed payloads are dropped, never fatal.
                    log::debug!("[Link] Dropping malformed frame for {track_id}: {err}");
                }
            }
        }
        Message::NodeStatus(ref info) => {
            services.planner.lock().note_status(
                &envelope.node_id,
                info.role,
                candidate_score(info),
            );
            if services.config.role != NodeRole::Client {
                services
                    .cluster
                    .registry
                    .observe_status(&envelope.node_id, info.clone());
            }
        }
        Message::MasterElection {
            term,
            candidate_score,
            ..
        } => {
            if services.config.role != NodeRole::Client {
                let actions = services.cluster.engine.lock().on_claim(
                    &envelope.node_id,
                    term,
                    candidate_score,
                    monotonic_secs(),
                );
                services.apply_election_actions(actions);
            }
        }
        Message::ClockSync { .. } | Message::Hello { .. } => {
            log::debug!("[Link] Unexpected {:?} from {master_id}", envelope.body);
        }
        Message::Error { code, ref message, .. } => {
            log::warn!("[Link] Error from {master_id}: {code} {message}");
        }
    }
}
