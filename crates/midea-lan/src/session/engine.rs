//! Session background task
//!
//! One engine per session. The task alternates between the socket, the
//! command queue, and a one-second tick; every suspension point also
//! watches the shutdown signal so `close()` returns promptly.

use crate::appliance::{ApplianceAdapter, StatusMap};
use crate::discovery::DeviceDescriptor;
use crate::error::{Result, SessionError};
use crate::session::{Credentials, ObserverTable, SessionCommand, SessionOptions, SessionState};
use midea_proto::packet::appliance::MIN_MESSAGE_SIZE;
use midea_proto::packet::{MIN_PACKET_SIZE, PACKET_MAGIC};
use midea_proto::{ApplianceMessage, Frame, FrameType, InnerPacket, MessageType, TransportCodec};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Ticks without a successful inbound parse before the connection is
/// declared dead
const IDLE_TICK_LIMIT: u32 = 120;

/// Handshake reply on the wire: 6-byte header, 2-byte counter, 64-byte body
const HANDSHAKE_RESPONSE_LEN: usize = 72;

/// Identity of a status query for unsupported-command learning
type QueryId = (u8, u8);

/// Resolves once `shutdown_rx` reports `true`. Wrapping this in its own
/// async fn keeps the non-`Send` `watch::Ref` internal to `wait_for` from
/// leaking into the output type of a surrounding `tokio::select!`.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

fn query_id(message: &ApplianceMessage) -> QueryId {
    (
        message.message_type,
        message.body.first().copied().unwrap_or(0),
    )
}

/// Why the ready loop ended
enum LoopExit {
    Shutdown,
    Reconnect,
}

/// Waiters and deadline for an in-flight waited refresh
struct PendingRefresh {
    waiters: Vec<oneshot::Sender<Result<()>>>,
    deadline: Instant,
    queries: Vec<QueryId>,
}

/// Result of draining the receive buffer once
#[derive(Default)]
struct InboundOutcome {
    /// At least one packet parsed successfully
    progressed: bool,

    /// The appliance signalled an error; the socket must be dropped
    drop_socket: bool,
}

/// Per-tick counters for the ready loop
#[derive(Default)]
struct Timers {
    idle: u32,
    refresh: u32,
    heartbeat: u32,
}

pub(crate) struct Engine {
    name: String,
    device_id: u64,
    address: IpAddr,
    port: u16,

    /// Transport version from the descriptor; decides v3 framing vs bare
    /// inner packets
    protocol_version: u8,

    /// Appliance protocol version for outgoing message headers; learned
    /// from QUERY_APPLIANCE replies
    appliance_version: u8,

    credentials: Option<Credentials>,
    refresh_interval_secs: u32,
    heartbeat_interval_secs: u32,

    adapter: Arc<Mutex<Box<dyn ApplianceAdapter>>>,
    observers: Arc<Mutex<ObserverTable>>,
    state: Arc<AtomicU8>,

    codec: TransportCodec,
    recv_buffer: Vec<u8>,
    unsupported: HashSet<QueryId>,
    pending_refresh: Option<PendingRefresh>,
    available: bool,
}

impl Engine {
    pub(crate) fn new(
        descriptor: &DeviceDescriptor,
        options: &SessionOptions,
        credentials: Option<Credentials>,
        adapter: Arc<Mutex<Box<dyn ApplianceAdapter>>>,
        observers: Arc<Mutex<ObserverTable>>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            name: options.name.clone(),
            device_id: descriptor.id,
            address: descriptor.address,
            port: descriptor.port,
            protocol_version: descriptor.protocol_version,
            appliance_version: descriptor.protocol_version,
            credentials,
            refresh_interval_secs: options.refresh_interval_secs.max(1),
            heartbeat_interval_secs: options.heartbeat_interval_secs.max(1),
            adapter,
            observers,
            state,
            codec: TransportCodec::new(),
            recv_buffer: Vec::new(),
            unsupported: HashSet::new(),
            pending_refresh: None,
            available: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(name = %self.name, device_id = self.device_id, "session task started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.drain_offline_commands(&mut cmd_rx);
            self.set_state(SessionState::Connecting);

            let address = SocketAddr::new(self.address, self.port);
            let connected = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                result = timeout(CONNECT_TIMEOUT, TcpStream::connect(address)) => result,
            };

            let stream = match connected {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    warn!(name = %self.name, %address, error = %e, "connect failed");
                    None
                }
                Err(_) => {
                    warn!(name = %self.name, %address, "connect timed out");
                    None
                }
            };
            let Some(mut stream) = stream else {
                self.set_available(false);
                self.set_state(SessionState::Reconnecting);
                if self.backoff(&mut shutdown_rx).await {
                    continue;
                } else {
                    break;
                }
            };
            info!(name = %self.name, %address, "connected");

            self.codec = TransportCodec::new();
            self.recv_buffer.clear();

            if self.protocol_version == 3 {
                self.set_state(SessionState::Authenticating);
                if let Err(e) = self.authenticate(&mut stream).await {
                    // Bad credentials never fix themselves; terminate and
                    // leave the decision to the caller
                    error!(name = %self.name, error = %e, "authentication failed, closing session");
                    break;
                }
            }

            self.set_state(SessionState::Ready);
            self.set_available(true);

            let exit = self.ready_loop(&mut stream, &mut cmd_rx, &mut shutdown_rx).await;
            drop(stream);
            self.codec.clear_tcp_key();
            self.set_available(false);

            match exit {
                LoopExit::Shutdown => {
                    self.fail_pending(|| SessionError::Closed);
                    break;
                }
                LoopExit::Reconnect => {
                    self.fail_pending(|| SessionError::NotConnected);
                    self.set_state(SessionState::Reconnecting);
                    if !self.backoff(&mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        self.fail_pending(|| SessionError::Closed);
        self.available = false;
        self.notify_availability(false);
        self.set_state(SessionState::Closed);
        info!(name = %self.name, "session task stopped");
    }

    /// One connected episode; returns why the connection ended
    async fn ready_loop(
        &mut self,
        stream: &mut TcpStream,
        cmd_rx: &mut mpsc::Receiver<SessionCommand>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        let mut timers = Timers::default();
        let mut read_buf = vec![0u8; 4096];

        // Prime the state as soon as the connection is up
        if let Some(exit) = self.start_refresh(stream, None).await {
            return exit;
        }

        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx) => {
                    return LoopExit::Shutdown;
                }
                command = cmd_rx.recv() => {
                    let Some(command) = command else {
                        return LoopExit::Shutdown;
                    };
                    if let Some(exit) = self.handle_command(stream, command).await {
                        return exit;
                    }
                }
                result = stream.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            info!(name = %self.name, "appliance closed the connection");
                            return LoopExit::Reconnect;
                        }
                        Ok(n) => {
                            self.recv_buffer.extend_from_slice(&read_buf[..n]);
                            match self.process_inbound() {
                                Ok(outcome) => {
                                    if outcome.progressed {
                                        timers.idle = 0;
                                        self.complete_refresh();
                                    }
                                    if outcome.drop_socket {
                                        return LoopExit::Reconnect;
                                    }
                                }
                                Err(e) => {
                                    warn!(name = %self.name, error = %e, "inbound parse failed");
                                    return LoopExit::Reconnect;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(name = %self.name, error = %e, "socket read failed");
                            return LoopExit::Reconnect;
                        }
                    }
                }
                _ = tick.tick() => {
                    if let Some(exit) = self.on_tick(stream, &mut timers).await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn on_tick(&mut self, stream: &mut TcpStream, timers: &mut Timers) -> Option<LoopExit> {
        timers.idle += 1;
        timers.refresh += 1;
        timers.heartbeat += 1;

        self.expire_refresh();

        if timers.idle >= IDLE_TICK_LIMIT {
            warn!(name = %self.name, "heartbeat timeout, dropping connection");
            self.fail_pending(|| SessionError::HeartbeatTimeout);
            return Some(LoopExit::Reconnect);
        }

        if timers.heartbeat >= self.heartbeat_interval_secs {
            timers.heartbeat = 0;
            if let Err(e) = self.send_heartbeat(stream).await {
                warn!(name = %self.name, error = %e, "heartbeat write failed");
                return Some(LoopExit::Reconnect);
            }
        }

        if timers.refresh >= self.refresh_interval_secs {
            timers.refresh = 0;
            if let Some(exit) = self.start_refresh(stream, None).await {
                return Some(exit);
            }
        }

        None
    }

    async fn handle_command(
        &mut self,
        stream: &mut TcpStream,
        command: SessionCommand,
    ) -> Option<LoopExit> {
        match command {
            SessionCommand::Send { message_type, body } => {
                let appliance_type = self.lock_adapter().appliance_type();
                let mut message = ApplianceMessage::new(appliance_type, message_type, body);
                message.protocol_version = self.appliance_version;

                if let Err(e) = self.write_app_message(stream, &message).await {
                    warn!(name = %self.name, error = %e, "command write failed");
                    return Some(LoopExit::Reconnect);
                }
                None
            }
            SessionCommand::Refresh { reply } => self.start_refresh(stream, reply).await,
            SessionCommand::SetIp(ip) => {
                if ip == self.address {
                    None
                } else {
                    info!(name = %self.name, %ip, "address changed, reconnecting");
                    self.address = ip;
                    Some(LoopExit::Reconnect)
                }
            }
        }
    }

    /// Issue the refresh queries, skipping ones the appliance has already
    /// failed to answer
    async fn start_refresh(
        &mut self,
        stream: &mut TcpStream,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) -> Option<LoopExit> {
        let appliance_type = self.lock_adapter().appliance_type();
        let mut queries = vec![ApplianceMessage::query_appliance(appliance_type)];
        queries.extend(self.lock_adapter().build_queries());
        for query in &mut queries {
            query.protocol_version = self.appliance_version;
        }
        queries.retain(|query| !self.unsupported.contains(&query_id(query)));

        if queries.is_empty() {
            warn!(name = %self.name, "refresh impossible: every query is unsupported");
            if let Some(reply) = reply {
                let _ = reply.send(Err(SessionError::RefreshFailed));
            }
            return None;
        }

        let ids: Vec<QueryId> = queries.iter().map(query_id).collect();
        let mut write_result = Ok(());
        for query in &queries {
            if let Err(e) = self.write_app_message(stream, query).await {
                write_result = Err(e);
                break;
            }
        }
        if let Err(e) = write_result {
            warn!(name = %self.name, error = %e, "refresh write failed");
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return Some(LoopExit::Reconnect);
        }
        debug!(name = %self.name, queries = ids.len(), "refresh issued");

        if let Some(reply) = reply {
            let deadline = Instant::now() + RESPONSE_TIMEOUT;
            match &mut self.pending_refresh {
                Some(pending) => {
                    pending.waiters.push(reply);
                    pending.deadline = deadline;
                    pending.queries = ids;
                }
                None => {
                    self.pending_refresh = Some(PendingRefresh {
                        waiters: vec![reply],
                        deadline,
                        queries: ids,
                    });
                }
            }
        }
        None
    }

    /// Decode everything the receive buffer holds
    fn process_inbound(&mut self) -> Result<InboundOutcome> {
        let mut outcome = InboundOutcome::default();

        let messages: Vec<Vec<u8>> = if self.protocol_version == 3 {
            let mut buffer = std::mem::take(&mut self.recv_buffer);
            let decoded = self.codec.decode(&mut buffer);
            self.recv_buffer = buffer;

            let mut messages = Vec::new();
            for frame in decoded? {
                match frame {
                    Frame::Error => {
                        warn!(name = %self.name, "transport error frame");
                        outcome.drop_socket = true;
                    }
                    Frame::Message(data) => messages.push(data),
                }
            }
            messages
        } else {
            self.drain_v2_packets()?
        };

        for data in messages {
            if outcome.drop_socket {
                break;
            }
            self.handle_message(&data, &mut outcome)?;
        }
        Ok(outcome)
    }

    /// Protocol version 2 skips the outer frame; inner packets arrive bare
    fn drain_v2_packets(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();

        while self.recv_buffer.len() >= 6 {
            if self.recv_buffer[0..2] != PACKET_MAGIC {
                return Err(midea_proto::ProtocolError::Framing(format!(
                    "invalid inner packet magic: {:02x} {:02x}",
                    self.recv_buffer[0], self.recv_buffer[1]
                ))
                .into());
            }
            let Some(total) = InnerPacket::peek_length(&self.recv_buffer) else {
                break;
            };
            if total < MIN_PACKET_SIZE {
                return Err(midea_proto::ProtocolError::Framing(format!(
                    "impossible inner packet length: {total}"
                ))
                .into());
            }
            if self.recv_buffer.len() < total {
                break;
            }
            packets.push(self.recv_buffer.drain(..total).collect());
        }

        Ok(packets)
    }

    /// Route one decoded transport payload
    fn handle_message(&mut self, data: &[u8], outcome: &mut InboundOutcome) -> Result<()> {
        if data == b"ERROR" {
            warn!(name = %self.name, "appliance reported an error, dropping connection");
            outcome.drop_socket = true;
            return Ok(());
        }

        let packet = InnerPacket::parse(data)?;
        if packet.body.first() != Some(&0xAA) || packet.body.len() < MIN_MESSAGE_SIZE {
            // Heartbeat acknowledgements and other non-appliance traffic
            debug!(name = %self.name, len = packet.body.len(), "non-appliance packet");
            outcome.progressed = true;
            return Ok(());
        }

        let message = ApplianceMessage::parse(&packet.body)?;
        outcome.progressed = true;

        if message.known_type() == Some(MessageType::QueryAppliance) {
            if message.protocol_version != 0 && message.protocol_version != self.appliance_version
            {
                info!(
                    name = %self.name,
                    version = message.protocol_version,
                    "appliance protocol version updated"
                );
                self.appliance_version = message.protocol_version;
            }
            return Ok(());
        }

        let status = self.lock_adapter().process_message(&packet.body);
        if !status.is_empty() {
            self.broadcast_status(status);
        }
        Ok(())
    }

    async fn authenticate(&mut self, stream: &mut TcpStream) -> Result<()> {
        let credentials = self.credentials.clone().ok_or_else(|| {
            SessionError::Credentials("protocol version 3 requires a token and key".to_string())
        })?;

        let request = self
            .codec
            .encode(&credentials.token, FrameType::HandshakeRequest)?;
        stream
            .write_all(&request)
            .await
            .map_err(|e| SessionError::Auth(format!("handshake write failed: {e}")))?;

        let mut response = [0u8; HANDSHAKE_RESPONSE_LEN];
        timeout(RESPONSE_TIMEOUT, stream.read_exact(&mut response))
            .await
            .map_err(|_| SessionError::Auth("handshake timed out".to_string()))?
            .map_err(|e| SessionError::Auth(format!("handshake read failed: {e}")))?;

        self.codec
            .authenticate(&response[8..], &credentials.key)
            .map_err(|e| SessionError::Auth(e.to_string()))?;
        debug!(name = %self.name, "handshake complete");
        Ok(())
    }

    async fn send_heartbeat(&mut self, stream: &mut TcpStream) -> Result<()> {
        debug!(name = %self.name, "heartbeat");
        let packet = InnerPacket::heartbeat(self.device_id).encode();
        self.write_packet(stream, packet).await
    }

    async fn write_app_message(
        &mut self,
        stream: &mut TcpStream,
        message: &ApplianceMessage,
    ) -> Result<()> {
        let packet = InnerPacket::new(self.device_id, message.encode()).encode();
        self.write_packet(stream, packet).await
    }

    async fn write_packet(&mut self, stream: &mut TcpStream, packet: Vec<u8>) -> Result<()> {
        let framed = if self.protocol_version == 3 {
            self.codec.encode(&packet, FrameType::EncryptedRequest)?
        } else {
            packet
        };
        stream.write_all(&framed).await?;
        Ok(())
    }

    /// Wait out the reconnect backoff; false means shutdown arrived first
    async fn backoff(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = wait_for_shutdown(shutdown_rx) => false,
            _ = sleep(RECONNECT_BACKOFF) => true,
        }
    }

    /// Apply queued commands while disconnected
    fn drain_offline_commands(&mut self, cmd_rx: &mut mpsc::Receiver<SessionCommand>) {
        while let Ok(command) = cmd_rx.try_recv() {
            match command {
                SessionCommand::SetIp(ip) => {
                    if ip != self.address {
                        info!(name = %self.name, %ip, "address updated");
                        self.address = ip;
                    }
                }
                SessionCommand::Send { .. } => {
                    warn!(name = %self.name, "dropping command, session not connected");
                }
                SessionCommand::Refresh { reply } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(SessionError::NotConnected));
                    }
                }
            }
        }
    }

    fn complete_refresh(&mut self) {
        if let Some(pending) = self.pending_refresh.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn expire_refresh(&mut self) {
        let expired = self
            .pending_refresh
            .as_ref()
            .is_some_and(|pending| Instant::now() >= pending.deadline);
        if !expired {
            return;
        }
        if let Some(pending) = self.pending_refresh.take() {
            for id in &pending.queries {
                if self.unsupported.insert(*id) {
                    warn!(
                        name = %self.name,
                        message_type = %format_args!("0x{:02x}", id.0),
                        "query timed out, marked unsupported"
                    );
                }
            }
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SessionError::ResponseTimeout));
            }
        }
    }

    fn fail_pending(&mut self, make_error: impl Fn() -> SessionError) {
        if let Some(pending) = self.pending_refresh.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(make_error()));
            }
        }
    }

    fn lock_adapter(&self) -> MutexGuard<'_, Box<dyn ApplianceAdapter>> {
        self.adapter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn set_available(&mut self, available: bool) {
        if self.available == available {
            return;
        }
        self.available = available;
        self.notify_availability(available);
    }

    fn notify_availability(&self, available: bool) {
        let mut status = StatusMap::new();
        status.insert("available".to_string(), available.into());
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .notify(&status);
    }

    fn broadcast_status(&self, mut status: StatusMap) {
        status.insert("available".to_string(), true.into());
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .notify(&status);
    }
}
