//! Device sessions
//!
//! A session pairs one device descriptor with one TCP connection and one
//! background task:
//!
//! ```text
//! Idle --open()--> Connecting --tcp--> Authenticating --handshake--> Ready
//! Ready --error/timeout--> Reconnecting --backoff--> Connecting
//! any --close()--> Closed
//! ```
//!
//! User-facing methods never touch the socket; they enqueue work onto the
//! task over a bounded channel. Observers are invoked from the task, in
//! strict arrival order of the updates they describe.

mod engine;

use crate::appliance::{ApplianceAdapter, StatusMap};
use crate::discovery::DeviceDescriptor;
use crate::error::{Result, SessionError};
use engine::Engine;
use midea_proto::MessageType;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Depth of the per-session command queue
pub(crate) const COMMAND_QUEUE_DEPTH: usize = 32;

/// Token and key material for the v3 handshake
#[derive(Clone)]
pub struct Credentials {
    /// 64-byte token offered during the handshake
    pub token: [u8; 64],

    /// 32-byte key the session key is derived against
    pub key: [u8; 32],
}

impl Credentials {
    /// Decode credentials from their hex configuration form
    pub fn from_hex(token: &str, key: &str) -> Result<Self> {
        let token_bytes = hex::decode(token.trim())
            .map_err(|e| SessionError::Credentials(format!("token is not hex: {e}")))?;
        let key_bytes = hex::decode(key.trim())
            .map_err(|e| SessionError::Credentials(format!("key is not hex: {e}")))?;

        Ok(Self {
            token: token_bytes.try_into().map_err(|b: Vec<u8>| {
                SessionError::Credentials(format!("token is {} bytes, expected 64", b.len()))
            })?,
            key: key_bytes.try_into().map_err(|b: Vec<u8>| {
                SessionError::Credentials(format!("key is {} bytes, expected 32", b.len()))
            })?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    /// Key material is never logged
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}

/// Tunable session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Session name used in log output
    pub name: String,

    /// Seconds between status refresh cycles
    pub refresh_interval_secs: u32,

    /// Seconds between keep-alive packets
    pub heartbeat_interval_secs: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: "midea".to_string(),
            refresh_interval_secs: 30,
            heartbeat_interval_secs: 10,
        }
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Created, background task not yet started
    Idle = 0,
    /// Establishing the TCP connection
    Connecting = 1,
    /// Running the v3 handshake
    Authenticating = 2,
    /// Connected; commands and refreshes flow
    Ready = 3,
    /// Waiting out the backoff before the next connect attempt
    Reconnecting = 4,
    /// Shut down; reopen to use again
    Closed = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Authenticating,
            3 => Self::Ready,
            4 => Self::Reconnecting,
            5 => Self::Closed,
            _ => Self::Idle,
        }
    }
}

/// Tag identifying one registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

pub(crate) type Observer = Box<dyn Fn(&StatusMap) + Send + Sync>;

/// Observer registry shared between the handle and the task
#[derive(Default)]
pub(crate) struct ObserverTable {
    next_id: u64,
    observers: Vec<(ObserverHandle, Observer)>,
}

impl ObserverTable {
    fn register(&mut self, observer: Observer) -> ObserverHandle {
        let handle = ObserverHandle(self.next_id);
        self.next_id += 1;
        self.observers.push((handle, observer));
        handle
    }

    fn unregister(&mut self, handle: ObserverHandle) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(h, _)| *h != handle);
        self.observers.len() != before
    }

    pub(crate) fn notify(&self, status: &StatusMap) {
        for (_, observer) in &self.observers {
            observer(status);
        }
    }
}

/// Work enqueued from user-facing methods to the background task
pub(crate) enum SessionCommand {
    Send {
        message_type: MessageType,
        body: Vec<u8>,
    },
    Refresh {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    SetIp(IpAddr),
}

/// One controlled appliance: descriptor, socket, and background task
///
/// Dropping the session signals the task to stop but does not wait for
/// the teardown that [`DeviceSession::close`] performs; call `close`
/// first.
pub struct DeviceSession {
    descriptor: DeviceDescriptor,
    options: SessionOptions,
    credentials: Option<Credentials>,
    adapter: Arc<Mutex<Box<dyn ApplianceAdapter>>>,
    observers: Arc<Mutex<ObserverTable>>,
    state: Arc<AtomicU8>,
    cmd_tx: Option<mpsc::Sender<SessionCommand>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Create a session for one discovered (or manually described) device
    ///
    /// Credentials are required for protocol version 3 and ignored for
    /// version 2.
    pub fn new(
        descriptor: DeviceDescriptor,
        credentials: Option<Credentials>,
        adapter: Box<dyn ApplianceAdapter>,
        options: SessionOptions,
    ) -> Result<Self> {
        match descriptor.protocol_version {
            2 => {}
            3 => {
                if credentials.is_none() {
                    return Err(SessionError::Credentials(
                        "protocol version 3 requires a token and key".to_string(),
                    ));
                }
            }
            other => {
                return Err(SessionError::Connect(format!(
                    "unsupported protocol version {other}"
                )));
            }
        }

        Ok(Self {
            descriptor,
            options,
            credentials,
            adapter: Arc::new(Mutex::new(adapter)),
            observers: Arc::new(Mutex::new(ObserverTable::default())),
            state: Arc::new(AtomicU8::new(SessionState::Idle as u8)),
            cmd_tx: None,
            shutdown_tx: None,
            task: None,
        })
    }

    /// Start the background task; idempotent, returns immediately
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Engine::new(
            &self.descriptor,
            &self.options,
            self.credentials.clone(),
            Arc::clone(&self.adapter),
            Arc::clone(&self.observers),
            Arc::clone(&self.state),
        );

        debug!(name = %self.options.name, "opening session");
        self.cmd_tx = Some(cmd_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(tokio::spawn(engine.run(cmd_rx, shutdown_rx)));
    }

    /// Signal shutdown and wait for the background task to finish
    ///
    /// Idempotent. Every pending suspension inside the task returns
    /// promptly; observers receive a final `available: false` update.
    pub async fn close(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.cmd_tx = None;
        self.state
            .store(SessionState::Closed as u8, Ordering::SeqCst);
    }

    /// Send one appliance command
    ///
    /// Fails with [`SessionError::NotConnected`] unless the session is
    /// ready. Commands enqueued just before a `close()` are not guaranteed
    /// to be transmitted.
    pub async fn send_command(&self, message_type: MessageType, body: Vec<u8>) -> Result<()> {
        if self.state() != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }
        let tx = self.cmd_tx.as_ref().ok_or(SessionError::NotConnected)?;
        tx.send(SessionCommand::Send { message_type, body })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Trigger a status refresh cycle
    ///
    /// With `wait`, blocks until any response parses successfully or the
    /// 5-second window elapses ([`SessionError::ResponseTimeout`]); without
    /// it, the queries are fire-and-forget.
    pub async fn refresh_status(&self, wait: bool) -> Result<()> {
        if self.state() != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }
        let tx = self.cmd_tx.as_ref().ok_or(SessionError::NotConnected)?;

        if wait {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(SessionCommand::Refresh {
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| SessionError::Closed)?;
            reply_rx.await.map_err(|_| SessionError::Closed)?
        } else {
            tx.send(SessionCommand::Refresh { reply: None })
                .await
                .map_err(|_| SessionError::Closed)
        }
    }

    /// Register an observer for status updates and availability changes
    ///
    /// Callbacks run on the session task and must not block.
    pub fn register_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&StatusMap) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(Box::new(observer))
    }

    /// Remove a previously registered observer
    pub fn unregister_observer(&self, handle: ObserverHandle) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(handle)
    }

    /// Point the session at a new address; a changed IP tears the
    /// connection down and reconnects
    pub async fn set_ip(&self, ip: IpAddr) -> Result<()> {
        let tx = self.cmd_tx.as_ref().ok_or(SessionError::NotConnected)?;
        tx.send(SessionCommand::SetIp(ip))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The descriptor this session is bound to
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}
