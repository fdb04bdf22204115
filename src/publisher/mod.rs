// SPDX-License-Identifier: Apache-2.0

//! Sends spooled batches to the collector and reports what it acknowledged.
//!
//! One payload is in flight at a time. It is sent as `1W` followed by `1C`,
//! then `1A` frames are read until its last sequence is acknowledged. A `1A`
//! for a strict prefix forwards that prefix to the registrar and keeps the
//! rest. On any network failure the connection is dropped, and after the
//! reconnect delay the outstanding events are sent again under the same
//! sequence numbers.

pub mod payload;
pub mod protocol;
pub mod transport;

pub use payload::{AckOutcome, Payload};
pub use transport::{Connection, Connector};

use crate::admin::{DataEntry, KeyValue, Value as ApiValue};
use crate::bounded_channel::BoundedReceiver;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::event::Event;
use crate::registrar::{EventSpool, RegistrarEvent};
use crate::util::calculate_speed;
use rand::seq::SliceRandom;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Idle time after which an empty `1W` is sent to keep the connection open.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(900);
const METER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct PublisherStatus {
    server: Option<String>,
    connected: bool,
    pending_events: usize,
    pending_payloads: usize,
    last_ack: u32,
    published_lines: u64,
    line_speed: f64,
}

/// How a delivery attempt ended.
enum Delivery {
    Complete,
    /// Shutdown was requested and the collector did not finish in time.
    Abandoned,
}

pub struct Publisher {
    input: BoundedReceiver<Vec<Event>>,
    registrar: EventSpool,
    config: watch::Receiver<Arc<Config>>,
    connector: Connector,
    connector_config: Arc<Config>,
    last_ack: u32,
    status: Arc<RwLock<PublisherStatus>>,
    meter: Meter,
}

struct Meter {
    at: Instant,
    lines: u64,
    idle: u32,
}

impl Publisher {
    /// Fails if the transport cannot be set up, e.g. unreadable certificates.
    pub fn new(
        input: BoundedReceiver<Vec<Event>>,
        registrar: EventSpool,
        config: watch::Receiver<Arc<Config>>,
    ) -> Result<Self> {
        let current = config.borrow().clone();
        let connector = Connector::new(&current.network)?;
        Ok(Self {
            input,
            registrar,
            config,
            connector,
            connector_config: current,
            last_ack: 0,
            status: Arc::new(RwLock::new(PublisherStatus::default())),
            meter: Meter {
                at: Instant::now(),
                lines: 0,
                idle: 0,
            },
        })
    }

    /// Admin entry describing the connection and the payload in flight.
    pub fn snapshot_entry(&self) -> DataEntry {
        let status = self.status.clone();
        DataEntry::new(move || {
            let status = status.read().unwrap();
            let server = match &status.server {
                Some(server) => ApiValue::String(server.clone()),
                None => ApiValue::Null,
            };
            KeyValue::new()
                .with("server", server)
                .with(
                    "status",
                    if status.connected { "connected" } else { "disconnected" },
                )
                .with("pending_payloads", ApiValue::Number(status.pending_payloads as i64))
                .with("pending_events", ApiValue::Number(status.pending_events as i64))
                .with("last_ack_sequence", ApiValue::Number(status.last_ack as i64))
                .with("published_lines", ApiValue::Number(status.published_lines as i64))
                .with("speed_lps", ApiValue::Float(status.line_speed))
                .into()
        })
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut connection: Option<Connection> = None;
        let mut pending: Option<Payload> = None;
        let mut meter = tokio::time::interval(METER_INTERVAL);
        let keepalive = tokio::time::sleep(KEEPALIVE_INTERVAL);
        tokio::pin!(keepalive);

        debug!("Publisher started");
        let result = loop {
            if connection.is_none() {
                if cancel.is_cancelled() {
                    break Ok(());
                }
                match self.connect().await {
                    Ok(conn) => {
                        info!(server = conn.server(), addr = %conn.addr(), "Connected to collector");
                        self.set_connected(Some(conn.server()));
                        connection = Some(conn);
                    }
                    Err(e) => {
                        let reconnect = self.config.borrow().network.reconnect;
                        warn!(error = %e, ?reconnect, "Failed to connect, will retry");
                        select! {
                            _ = cancel.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(reconnect) => continue,
                        }
                    }
                }
            }

            let Some(conn) = connection.as_mut() else {
                continue;
            };

            if pending.is_none() {
                select! {
                    biased;

                    _ = cancel.cancelled() => break Ok(()),

                    batch = self.input.next() => match batch {
                        Some(events) if events.is_empty() => continue,
                        Some(events) => {
                            debug!(events = events.len(), "Publisher received payload");
                            pending = Some(Payload::new(events, self.last_ack.wrapping_add(1)));
                            self.update_pending(pending.as_ref());
                        }
                        None => {
                            debug!("Publisher input closed");
                            break Ok(());
                        }
                    },

                    _ = meter.tick() => {
                        self.meter();
                        continue;
                    }

                    _ = &mut keepalive => {
                        keepalive.as_mut().reset(tokio::time::Instant::now() + KEEPALIVE_INTERVAL);
                        let window = self.config.borrow().general.spool_size as u32;
                        debug!(window, "Sending keepalive");
                        if let Err(e) = conn.write(&[&protocol::encode_window(window)[..]]).await {
                            warn!(error = %e, "Keepalive failed, reconnecting");
                            self.disconnect(&mut connection).await;
                        }
                        continue;
                    }
                }
            }

            let Some(payload) = pending.as_mut() else {
                continue;
            };

            match self.deliver(conn, payload, &cancel).await {
                Ok(Delivery::Complete) => {
                    pending = None;
                    self.update_pending(None);
                    keepalive.as_mut().reset(tokio::time::Instant::now() + KEEPALIVE_INTERVAL);
                }
                Ok(Delivery::Abandoned) => break Ok(()),
                Err(Error::ChannelSend) => break Err(Error::ChannelSend),
                Err(e) => {
                    let reconnect = self.config.borrow().network.reconnect;
                    warn!(
                        error = %e,
                        pending = payload.len(),
                        ?reconnect,
                        "Transmission failed, reconnecting"
                    );
                    self.disconnect(&mut connection).await;
                    select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(reconnect) => {}
                    }
                }
            }
        };

        if let Some(payload) = &pending {
            warn!(
                events = payload.len(),
                first_sequence = payload.first_sequence(),
                "Exiting with unacknowledged events, they will be sent again on restart"
            );
        }
        if let Some(conn) = connection.take() {
            conn.close().await;
        }
        self.set_connected(None);
        info!("Publisher exiting");
        result
    }

    async fn connect(&mut self) -> Result<Connection> {
        let config = self.config.borrow_and_update().clone();
        if !Arc::ptr_eq(&config, &self.connector_config) {
            self.connector = Connector::new(&config.network)?;
            self.connector_config = config.clone();
        }

        let server = config
            .network
            .servers
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| Error::Config("no servers configured".to_string()))?;
        self.connector.connect(server).await
    }

    async fn disconnect(&self, connection: &mut Option<Connection>) {
        if let Some(conn) = connection.take() {
            conn.close().await;
        }
        self.set_connected(None);
    }

    /// Sends what is left of `payload` and reads acknowledgements until all
    /// of it is acknowledged.
    async fn deliver(
        &mut self,
        conn: &mut Connection,
        payload: &mut Payload,
        cancel: &CancellationToken,
    ) -> Result<Delivery> {
        let window = protocol::encode_window(payload.len() as u32);
        let frame = payload.encoded()?;
        conn.write(&[&window[..], &frame[..]]).await?;
        payload.mark_sent();
        debug!(
            events = payload.len(),
            first_sequence = payload.first_sequence(),
            last_sequence = payload.last_sequence(),
            bytes = frame.len(),
            "Payload sent"
        );

        // Reads are bounded by the network timeout, so shutdown is only checked
        // between frames. The collector gets one more timeout to finish.
        let grace = self.config.borrow().network.timeout;
        let mut shutdown_at: Option<Instant> = None;
        loop {
            if cancel.is_cancelled() {
                let at = *shutdown_at.get_or_insert_with(Instant::now);
                if at.elapsed() >= grace {
                    return Ok(Delivery::Abandoned);
                }
            }

            let sequence = conn.read_ack().await?;
            match payload.ack(sequence) {
                AckOutcome::Keepalive => {
                    debug!(sequence, "Received keepalive acknowledgement");
                }
                AckOutcome::Partial(events) => {
                    debug!(sequence, acked = events.len(), remaining = payload.len(), "Received partial acknowledgement");
                    self.acknowledge(sequence, events).await?;
                    self.update_pending(Some(&*payload));
                }
                AckOutcome::Complete(events) => {
                    let elapsed = payload.sent_at().map(|at| at.elapsed());
                    debug!(sequence, acked = events.len(), ?elapsed, "Payload acknowledged");
                    self.acknowledge(sequence, events).await?;
                    return Ok(Delivery::Complete);
                }
                AckOutcome::Invalid => {
                    return Err(Error::Protocol(format!(
                        "acknowledgement for sequence {} outside of {}..={}",
                        sequence,
                        payload.last_ack(),
                        payload.last_sequence()
                    )));
                }
            }
            self.meter_if_due();
        }
    }

    async fn acknowledge(&mut self, sequence: u32, events: Vec<Event>) -> Result<()> {
        self.last_ack = sequence;
        self.meter.lines += events.len() as u64;
        {
            let mut status = self.status.write().unwrap();
            status.last_ack = sequence;
            status.published_lines += events.len() as u64;
        }

        let contexts: Vec<_> = events.iter().filter_map(Event::context).collect();
        if contexts.is_empty() {
            return Ok(());
        }
        self.registrar.add(RegistrarEvent::Ack(contexts));
        self.registrar.send().await.inspect_err(|e| {
            error!(error = %e, "Registrar is gone, acknowledgements cannot be recorded");
        })
    }

    fn update_pending(&self, payload: Option<&Payload>) {
        let mut status = self.status.write().unwrap();
        status.pending_payloads = usize::from(payload.is_some());
        status.pending_events = payload.map_or(0, Payload::len);
    }

    fn set_connected(&self, server: Option<&str>) {
        let mut status = self.status.write().unwrap();
        status.connected = server.is_some();
        if let Some(server) = server {
            status.server = Some(server.to_string());
        }
    }

    fn meter_if_due(&mut self) {
        if self.meter.at.elapsed() >= METER_INTERVAL {
            self.meter();
        }
    }

    fn meter(&mut self) {
        let elapsed = self.meter.at.elapsed();
        let lines = std::mem::take(&mut self.meter.lines);
        self.meter.at = Instant::now();

        let mut status = self.status.write().unwrap();
        status.line_speed =
            calculate_speed(elapsed, status.line_speed, lines as f64, &mut self.meter.idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::codecs::CodecRegistry;
    use crate::event::{EventContext, StreamKey};
    use crate::harvester::FileId;
    use crate::registrar::{Registrar, StateFile};
    use protocol::tests::{DataFrame, decode_compressed_body};
    use std::net::SocketAddr;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn config(addr: SocketAddr) -> Arc<Config> {
        let json = format!(
            r#"{{"network": {{"transport": "tcp", "servers": ["{}"], "timeout": 2, "reconnect": "50ms"}}}}"#,
            addr
        );
        Arc::new(Config::from_json_str(&json, &CodecRegistry::builtin()).unwrap())
    }

    /// Reads one `1W` + `1C` pair, returning the window and decoded frames.
    async fn read_payload(socket: &mut TcpStream) -> (u32, Vec<DataFrame>) {
        let mut header = [0u8; 6];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(b"1W", &header[..2]);
        let window = u32::from_be_bytes(header[2..].try_into().unwrap());

        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(b"1C", &header[..2]);
        let len = u32::from_be_bytes(header[2..].try_into().unwrap()) as usize;
        let mut body = vec![0u8; len];
        socket.read_exact(&mut body).await.unwrap();
        (window, decode_compressed_body(&body))
    }

    async fn ack(socket: &mut TcpStream, sequence: u32) {
        let mut frame = b"1A".to_vec();
        frame.extend_from_slice(&sequence.to_be_bytes());
        socket.write_all(&frame).await.unwrap();
    }

    /// Events numbered `first..first + count`, each ten bytes long.
    fn events(first: usize, count: usize) -> Vec<Event> {
        (first..first + count)
            .map(|n| {
                let context = EventContext {
                    stream: StreamKey::new(1),
                    end_offset: n as i64 * 10,
                };
                Event::from_message(Some(context), &format!("event {}", n))
            })
            .collect()
    }

    fn sequences(frames: &[DataFrame]) -> Vec<u32> {
        frames.iter().map(|(s, _)| *s).collect()
    }

    async fn persisted_offset(dir: &Path) -> i64 {
        // The registrar writes after every batch, give it a moment.
        tokio::time::sleep(Duration::from_millis(200)).await;
        StateFile::new(dir).load().unwrap().unwrap()["/log/x.log"].offset()
    }

    #[tokio::test]
    async fn partial_ack_then_reconnect_resends_remainder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let registrar = Registrar::new(dir.path());
        let mut spool = registrar.connect().unwrap();
        spool.add(RegistrarEvent::Discover {
            key: StreamKey::new(1),
            path: "/log/x.log".to_string(),
            offset: 0,
            id: FileId::new(1, 1),
        });
        let registrar_task = tokio::spawn(registrar.run());
        spool.send().await.unwrap();

        let (input, input_rx) = bounded(4);
        let (_config_tx, config_rx) = watch::channel(config(addr));
        let publisher = Publisher::new(input_rx, spool, config_rx).unwrap();
        let snapshot = publisher.snapshot_entry();
        let cancel = CancellationToken::new();
        let publisher_task = tokio::spawn(publisher.run(cancel.clone()));

        input.send(events(1, 100)).await.unwrap();

        // First connection: acknowledge 37 of 100 then drop the socket.
        let (mut socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (window, frames) = read_payload(&mut socket).await;
        assert_eq!(100, window);
        assert_eq!((1..=100).collect::<Vec<u32>>(), sequences(&frames));
        ack(&mut socket, 37).await;
        assert_eq!(370, persisted_offset(dir.path()).await);
        drop(socket);

        // Second connection: the remainder arrives under its original sequences.
        let (mut socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (window, frames) = read_payload(&mut socket).await;
        assert_eq!(63, window);
        assert_eq!((38..=100).collect::<Vec<u32>>(), sequences(&frames));
        assert_eq!(("line".to_string(), "event 38".to_string()), frames[0].1[0]);
        assert_eq!(370, persisted_offset(dir.path()).await);

        ack(&mut socket, 37).await;
        ack(&mut socket, 100).await;
        assert_eq!(1000, persisted_offset(dir.path()).await);

        // The next payload continues the sequence on the same connection.
        input.send(events(101, 2)).await.unwrap();
        let (window, frames) = read_payload(&mut socket).await;
        assert_eq!(2, window);
        assert_eq!(vec![101, 102], sequences(&frames));
        ack(&mut socket, 102).await;
        assert_eq!(1020, persisted_offset(dir.path()).await);

        let ApiValue::KeyValue(status) = snapshot.value() else {
            panic!("snapshot is not a map");
        };
        assert_eq!(Some(&ApiValue::Number(102)), status.get("last_ack_sequence"));
        assert_eq!(Some(&ApiValue::Number(0)), status.get("pending_events"));
        assert_eq!(Some(&ApiValue::Number(102)), status.get("published_lines"));
        assert_eq!(Some(&ApiValue::from("connected")), status.get("status"));

        drop(input);
        timeout(WAIT, publisher_task).await.unwrap().unwrap().unwrap();
        timeout(WAIT, registrar_task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn unexpected_ack_forces_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registrar = Registrar::without_persistence();
        let spool = registrar.connect().unwrap();
        let registrar_task = tokio::spawn(registrar.run());

        let (input, input_rx) = bounded(4);
        let (_config_tx, config_rx) = watch::channel(config(addr));
        let publisher = Publisher::new(input_rx, spool, config_rx).unwrap();
        let cancel = CancellationToken::new();
        let publisher_task = tokio::spawn(publisher.run(cancel.clone()));

        input.send(events(1, 3)).await.unwrap();

        let (mut socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        read_payload(&mut socket).await;
        ack(&mut socket, 50).await;

        let (mut socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (_, frames) = read_payload(&mut socket).await;
        assert_eq!(vec![1, 2, 3], sequences(&frames));
        ack(&mut socket, 3).await;

        drop(input);
        timeout(WAIT, publisher_task).await.unwrap().unwrap().unwrap();
        timeout(WAIT, registrar_task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_unreachable_server_does_not_hang() {
        // Nothing listens on this port once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registrar = Registrar::without_persistence();
        let spool = registrar.connect().unwrap();
        let (input, input_rx) = bounded(4);
        let (_config_tx, config_rx) = watch::channel(config(addr));
        let publisher = Publisher::new(input_rx, spool, config_rx).unwrap();
        let cancel = CancellationToken::new();
        let publisher_task = tokio::spawn(publisher.run(cancel.clone()));

        input.send(events(1, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        timeout(WAIT, publisher_task).await.unwrap().unwrap().unwrap();
        drop(registrar);
    }
}
