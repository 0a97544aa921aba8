//! Reader and writer pumps.
//!
//! Exactly one reader and one writer exist per connection for its lifetime:
//! the reader pump is the sole consumer of the transport and the writer
//! pump its sole producer, communicating through the session's outbound
//! queue.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};

use tether_core::Session;
use tether_protocol::{codec, Outbound};

use crate::config::KeepaliveConfig;
use crate::metrics;
use crate::router;

/// Pump frames from the connection into the session.
///
/// Runs until the transport fails, the peer closes, the idle deadline
/// passes without traffic, or the session is torn down elsewhere (e.g. a
/// reconnect displaced it). Ends by tearing the session down, which is a
/// no-op when a forced disconnect got there first.
pub async fn reader_pump(
    mut receiver: SplitStream<WebSocket>,
    session: Arc<Session>,
    keepalive: &KeepaliveConfig,
) {
    let mut closed = session.closed_signal();

    loop {
        tokio::select! {
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                debug!(device = %session.token(), "Reader stopping: session torn down");
                break;
            }
            next = timeout(keepalive.read_idle(), receiver.next()) => {
                let message = match next {
                    Err(_) => {
                        warn!(device = %session.token(), "Read idle timeout");
                        metrics::record_error("idle_timeout");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        debug!(device = %session.token(), error = %e, "Transport read failed");
                        metrics::record_error("transport");
                        break;
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => handle_frame(&session, text.as_bytes()).await,
                    Message::Binary(data) => handle_frame(&session, &data).await,
                    // The transport answers pings itself; an inbound pong
                    // just restarts the idle window.
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => {
                        debug!(device = %session.token(), "Peer closed connection");
                        break;
                    }
                }
            }
        }
    }

    session.disconnect().await;
}

/// Decode one inbound frame and dispatch it.
///
/// A decode failure is a protocol error: logged, frame dropped, connection
/// kept open. An operation failure is reported back on the outbound queue.
async fn handle_frame(session: &Arc<Session>, raw: &[u8]) {
    metrics::record_message(raw.len(), "inbound");

    let envelope = match codec::decode(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(device = %session.token(), error = %e, "Undecodable envelope");
            metrics::record_error("protocol");
            return;
        }
    };

    if let Err(e) = router::dispatch(session, envelope).await {
        warn!(device = %session.token(), error = %e, "Command failed");
        metrics::record_error("dispatch");
        if let Ok(payload) = codec::encode(&Outbound::error(&e)) {
            if !session.try_queue(payload) {
                debug!(device = %session.token(), "Error envelope dropped; queue unavailable");
            }
        }
    }
}

/// Pump queued envelopes from the session to the connection.
///
/// One select services both inputs: the outbound queue and the keepalive
/// timer. Messages already queued behind the first one are coalesced into a
/// single newline-separated frame. Queue closure is the teardown signal —
/// the pump sends a close frame and exits. A failed write or keepalive
/// probe means the connection is dead (this is what detects a half-open
/// peer).
pub async fn writer_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    keepalive: KeepaliveConfig,
) {
    let period = keepalive.ping_interval();
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            message = outbound.recv() => {
                match message {
                    Some(first) => {
                        let frame = coalesce(first, &mut outbound);
                        metrics::record_message(frame_len(&frame), "outbound");
                        match timeout(keepalive.write_wait(), sender.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(error = %e, "Transport write failed");
                                break;
                            }
                            Err(_) => {
                                debug!("Transport write timed out");
                                break;
                            }
                        }
                    }
                    None => {
                        // Queue closed by the hub or the session.
                        let _ = timeout(
                            keepalive.write_wait(),
                            sender.send(Message::Close(None)),
                        )
                        .await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let probe = timeout(keepalive.write_wait(), sender.send(Message::Ping(Vec::new()))).await;
                if !matches!(probe, Ok(Ok(()))) {
                    debug!("Keepalive probe failed");
                    break;
                }
            }
        }
    }
}

/// Merge the first message with anything already queued into one frame.
fn coalesce(first: Bytes, outbound: &mut mpsc::Receiver<Bytes>) -> Message {
    let mut buf: Vec<u8> = first.to_vec();
    while let Ok(next) = outbound.try_recv() {
        buf.push(b'\n');
        buf.extend_from_slice(&next);
    }
    match String::from_utf8(buf) {
        Ok(text) => Message::Text(text),
        Err(raw) => Message::Binary(raw.into_bytes()),
    }
}

fn frame_len(frame: &Message) -> usize {
    match frame {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}
