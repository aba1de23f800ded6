//! Control-plane transport: framed JSON lines over TCP.
//!
//! The protocol contract assumes a reliable bidirectional stream of UTF-8
//! text frames, one message per frame. This module realizes it with
//! newline-delimited JSON over TCP via `LinesCodec`; `server` hosts the
//! coordinator side, `client` the outbound link used by endpoints and
//! standby replicas.

pub mod client;
pub mod server;

use futures::stream::{SplitSink, SplitStream};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::TempoError;
use crate::protocol::Envelope;
use crate::protocol_constants::MAX_FRAME_BYTES;

/// Write half of a control connection.
pub type ControlSink = SplitSink<Framed<TcpStream, LinesCodec>, String>;
/// Read half of a control connection.
pub type ControlStream = SplitStream<Framed<TcpStream, LinesCodec>>;

/// Wraps a TCP stream with the line framing used by the control plane.
#[must_use]
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LinesCodec> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES))
}

/// Sends one envelope as a single frame.
pub async fn send_frame(sink: &mut ControlSink, envelope: &Envelope) -> Result<(), TempoError> {
    let frame = envelope.to_frame()?;
    sink.send(frame)
        .await
        .map_err(|e| TempoError::TransportClosed(e.to_string()))
}
