//! Connection lifecycle: greeting, line loop, heartbeat, disconnect.
//!
//! Per connection, inbound frames are handled as a strict total order: one
//! full dispatch pass completes before the next line is parsed. The
//! heartbeat timer is the only self-rescheduling timer in the system; three
//! consecutive unanswered pings force-close the connection and are never
//! retried.

use super::{Connection, Outbound};
use crate::hub::Hub;
use crate::protocol;
use beacon_event_system::utils::current_timestamp_millis;
use beacon_event_system::{events, Event, EventBus};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Drives one accepted socket from greeting to disconnect.
///
/// The sequence on accept: register in the hub's live set, fire
/// `protocol_built` (extensions attach per-connection state), send the
/// greeting frame, start the heartbeat, fire `client_connected`, then read
/// lines until the transport closes. The disconnect path fires
/// `client_disconnected` exactly once and removes the connection from the
/// live set.
pub async fn handle_connection(hub: Arc<Hub>, stream: TcpStream, addr: SocketAddr) {
    let bus = hub.bus();
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(writer_task(write_half, outbound_rx));

    let conn = Arc::new(Connection::new(addr, Arc::downgrade(&hub), outbound_tx));
    hub.insert_connection(conn.clone()).await;
    info!("Client connecting - {addr}");

    let mut built = Event::with_source(events::PROTOCOL_BUILT, conn.clone());
    bus.dispatch(&mut built).await;

    conn.send(&protocol::greeting_frame());
    tokio::spawn(heartbeat_task(
        conn.clone(),
        bus.clone(),
        hub.heartbeat_interval(),
    ));

    let mut connected = Event::with_source(events::CLIENT_CONNECTED, conn.clone());
    bus.dispatch(&mut connected).await;

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = conn.closed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => process_line(&conn, &bus, &line).await,
                Ok(None) => break,
                Err(e) => {
                    debug!("Read error from {addr}: {e}");
                    break;
                }
            },
        }
    }

    if conn.begin_disconnect() {
        let mut disconnected = Event::with_source(events::CLIENT_DISCONNECTED, conn.clone());
        bus.dispatch(&mut disconnected).await;
    }
    hub.remove_connection(conn.id()).await;
    info!("Client {addr} disconnected");
}

/// Parses one line and dispatches the matching event.
///
/// A line that is not a JSON object gets a local error reply; the connection
/// stays open. A `{"pong": ...}` acknowledgment is consumed by the heartbeat
/// bookkeeping instead of reaching the extensions.
async fn process_line(conn: &Arc<Connection>, bus: &Arc<EventBus<Connection>>, line: &str) {
    debug!(connection = %conn.id(), "Data: {line}");

    let frame: Value = match serde_json::from_str(line) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            conn.send(&protocol::malformed_frame_reply());
            return;
        }
    };

    if let Some(timestamp) = protocol::pong_timestamp(&frame) {
        if conn.take_pong(&timestamp).await {
            let mut pong = Event::with_source(events::PONG_RECEIVED, conn.clone())
                .with_data(json!({ "timestamp": timestamp }));
            bus.dispatch(&mut pong).await;
        } else {
            debug!(connection = %conn.id(), "Unmatched pong: {timestamp}");
        }
        return;
    }

    let mut received =
        Event::with_source(events::DATA_RECEIVED, conn.clone()).with_data(frame);
    bus.dispatch(&mut received).await;
}

/// Sends a ping every interval; more than 2 already-outstanding pings is a
/// dead client.
async fn heartbeat_task(
    conn: Arc<Connection>,
    bus: Arc<EventBus<Connection>>,
    period: Duration,
) {
    let mut ticker = interval(period);
    // The first tick of a tokio interval completes immediately; the first
    // ping goes out one full period after connect.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !conn.is_connected() {
            break;
        }

        if conn.outstanding_pings().await > 2 {
            warn!(connection = %conn.id(), "Missed 3 heartbeats, closing");
            conn.send(&protocol::ping_timeout_frame());
            conn.close();
            break;
        }

        let timestamp = current_timestamp_millis().to_string();
        conn.push_ping(timestamp.clone()).await;
        conn.send(&protocol::ping_frame(&timestamp));

        let mut ping = Event::with_source(events::PING_SENT, conn.clone())
            .with_data(json!({ "timestamp": timestamp }));
        bus.dispatch(&mut ping).await;
    }
}

/// Owns the write half. Frames arrive already serialized; `Close` flushes
/// what is queued ahead of it and shuts the socket down.
pub(crate) async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Frame(line) => {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
                let _ = write_half.flush().await;
            }
            Outbound::Close => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}
