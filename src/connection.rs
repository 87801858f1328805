//! Connection lifecycle, background read loop and command rendezvous.
//!
//! A [`Backend`] owns one transport at a time. Connecting opens the transport
//! through a [`Connector`], splits it, keeps the write half behind a lock and
//! moves the read half into a background task that feeds decoded line
//! batches to the protocol parser. Commands are serialized through
//! [`Backend::transact`]: one command in flight per backend, answered by the
//! next ACK or NAK the read loop captures.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::LineBatchCodec;
use crate::error::{BackendError, Result};
use crate::protocol::{Link, Protocol};
use crate::session::{BackendEvent, Session, Transaction};
use crate::transport::{BoxedTransport, Connector, TcpConnector};

// Where to reach a device; the port falls back to the protocol default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl BackendConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

// What `wait_for_response` is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    Prelude,
    Acknowledgment,
}

type Writer = FramedWrite<WriteHalf<BoxedTransport>, LineBatchCodec>;
type Reader = FramedRead<ReadHalf<BoxedTransport>, LineBatchCodec>;

struct ReadLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared<P: Protocol> {
    host: String,
    port: u16,
    connector: Arc<dyn Connector>,
    link: Mutex<Link<P>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    read_loop: tokio::sync::Mutex<Option<ReadLoop>>,
    // Bumped after every parsed batch and whenever reading stops
    response_ready: watch::Sender<u64>,
    connecting: tokio::sync::Mutex<()>,
    // One command in flight at a time
    transactions: tokio::sync::Mutex<()>,
}

pub struct Backend<P: Protocol> {
    shared: Arc<Shared<P>>,
}

impl<P: Protocol> Clone for Backend<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Holds notifications for one property until dropped.
///
/// Changes made while the guard lives are coalesced into a single
/// notification that is dispatched when the guard goes away.
pub struct Hold<'a, P: Protocol> {
    backend: &'a Backend<P>,
    name: &'static str,
}

impl<P: Protocol> Drop for Hold<'_, P> {
    fn drop(&mut self) {
        let mut link = self.backend.lock();
        link.session.notifier.release(self.name);
        link.dispatch();
    }
}

impl<P: Protocol> Backend<P> {
    pub fn new(config: BackendConfig, device: P) -> Self {
        Self::with_connector(config, device, Arc::new(TcpConnector))
    }

    pub fn with_connector(config: BackendConfig, device: P, connector: Arc<dyn Connector>) -> Self {
        let port = config.port.unwrap_or(P::DEFAULT_PORT);
        let session = Session::new(format!("{}:{}", config.host, port));
        Self {
            shared: Arc::new(Shared {
                host: config.host,
                port,
                connector,
                link: Mutex::new(Link::new(session, device)),
                writer: tokio::sync::Mutex::new(None),
                read_loop: tokio::sync::Mutex::new(None),
                response_ready: watch::Sender::new(0),
                connecting: tokio::sync::Mutex::new(()),
                transactions: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Build a backend and connect it.
    ///
    /// Resolves to `None` unless the device is connected, finished its
    /// prelude and reported a device id.
    pub async fn create(config: BackendConfig, device: P) -> Option<Self> {
        Self::create_with_connector(config, device, Arc::new(TcpConnector)).await
    }

    pub async fn create_with_connector(
        config: BackendConfig,
        device: P,
        connector: Arc<dyn Connector>,
    ) -> Option<Self> {
        let backend = Self::with_connector(config, device, connector);
        if let Err(e) = backend.connect().await {
            log::error!("Failed to connect to {} at {}: {}", P::NAME, backend.address(), e);
            return None;
        }
        let ready = backend.read(|_, session| session.is_ready() && session.device_id().is_some());
        if !ready {
            log::warn!("{} at {} did not identify itself", P::NAME, backend.address());
            return None;
        }
        Some(backend)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Link<P>> {
        self.shared.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&P, &Session) -> R) -> R {
        let link = self.lock();
        f(&link.device, &link.session)
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut P, &mut Session) -> R) -> R {
        self.lock().update(f)
    }

    pub fn host(&self) -> &str {
        &self.shared.host
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.shared.host, self.shared.port)
    }

    pub fn is_connected(&self) -> bool {
        self.read(|_, session| session.is_connected())
    }

    pub fn is_prelude_parsed(&self) -> bool {
        self.read(|_, session| session.is_prelude_parsed())
    }

    pub fn device_id(&self) -> Option<String> {
        self.read(|_, session| session.device_id().map(str::to_string))
    }

    pub fn device_model(&self) -> Option<String> {
        self.read(|_, session| session.device_model().map(str::to_string))
    }

    pub fn device_version(&self) -> Option<String> {
        self.read(|_, session| session.device_version().map(str::to_string))
    }

    // Receive every property change and preset/monitor event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.read(|_, session| session.subscribe())
    }

    // Hold notifications for `name` until the returned guard is dropped
    pub fn hold(&self, name: &'static str) -> Hold<'_, P> {
        self.lock().session.notifier.hold(name);
        Hold {
            backend: self,
            name,
        }
    }

    /// Open the transport and wait for the device prelude.
    ///
    /// Does nothing when already connected.
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.shared.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.lock().begin_session();
        self.stop_read_loop().await;

        log::debug!("Connecting to {} at {}", P::NAME, self.address());
        let transport = match self
            .shared
            .connector
            .open(&self.shared.host, self.shared.port)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Failed to open {}: {}", self.address(), e);
                self.lock().end_session();
                return Err(BackendError::Transport(e));
            }
        };

        let (read_half, write_half) = tokio::io::split(transport);
        *self.shared.writer.lock().await = Some(FramedWrite::new(write_half, LineBatchCodec::new()));

        let cancel = CancellationToken::new();
        {
            let mut link = self.lock();
            link.session.read_enabled = true;
            link.session.cancel = Some(cancel.clone());
        }
        let reader = FramedRead::new(read_half, LineBatchCodec::new());
        let handle = tokio::spawn(read_loop(self.clone(), reader, cancel.clone()));
        *self.shared.read_loop.lock().await = Some(ReadLoop { cancel, handle });

        self.wait_for_response(WaitFor::Prelude).await;
        if !self.read(|_, session| session.is_ready()) {
            return Err(BackendError::HandshakeIncomplete);
        }
        log::info!(
            "Connected to {} {} ({})",
            P::NAME,
            self.device_model().as_deref().unwrap_or("Unknown"),
            self.address()
        );
        Ok(())
    }

    // Stop the read loop, close the transport and mark the backend disconnected
    pub async fn disconnect(&self) {
        log::debug!("Disconnecting from {}", self.address());
        self.stop_read_loop().await;
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                log::warn!("Error closing connection to {}: {}", self.address(), e);
            }
        }
        self.lock().end_session();
        self.signal_response();
        log::info!("Disconnected from {}", self.address());
    }

    async fn stop_read_loop(&self) {
        let read_loop = self.shared.read_loop.lock().await.take();
        if let Some(ReadLoop { cancel, handle }) = read_loop {
            cancel.cancel();
            if let Err(e) = handle.await {
                log::error!("{} read loop failed: {}", P::NAME, e);
            }
        }
    }

    // Called by the read loop when the device goes away
    async fn connection_lost(&self) {
        self.shared.writer.lock().await.take();
        self.lock().end_session();
    }

    /// Write raw protocol text to the device.
    ///
    /// Connects first when needed. A failed write drops the connection and
    /// the payload; callers notice through the missing acknowledgment.
    pub async fn send(&self, payload: String) {
        if !self.is_connected() {
            if let Err(e) = self.connect().await {
                log::warn!("Dropping payload for {}: {}", self.address(), e);
                return;
            }
        }
        let mut writer = self.shared.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            log::warn!("Dropping payload for {}: not connected", self.address());
            return;
        };
        for line in payload.lines() {
            log::debug!("---> {}", line);
        }
        if let Err(e) = sink.send(payload).await {
            log::error!("Failed to send to {}: {}", self.address(), e);
            writer.take();
            drop(writer);
            self.lock().end_session();
        }
    }

    /// Block until the read loop signals the rendezvous.
    ///
    /// `WaitFor::Prelude` returns once the handshake is done or the read loop
    /// stopped, always yielding `None`. `WaitFor::Acknowledgment` yields the
    /// captured ACK/NAK line and clears it, or `None` if the read loop stopped
    /// first.
    pub async fn wait_for_response(&self, wait: WaitFor) -> Option<String> {
        // Subscribed before the first check so every later batch wakes us
        let mut ready = self.shared.response_ready.subscribe();
        loop {
            {
                let mut link = self.lock();
                match wait {
                    WaitFor::Prelude if link.session.is_prelude_parsed() => return None,
                    WaitFor::Acknowledgment => {
                        if let Some(response) = link.session.acknowledgment.take() {
                            log::debug!("Received acknowledgment: {}", response);
                            return Some(response);
                        }
                    }
                    WaitFor::Prelude => {}
                }
                if !link.session.read_enabled {
                    return None;
                }
            }
            if ready.changed().await.is_err() {
                return None;
            }
        }
    }

    fn signal_response(&self) {
        self.shared.response_ready.send_modify(|batches| *batches = batches.wrapping_add(1));
    }

    /// Send one command block and wait for the device to answer it.
    ///
    /// Returns `true` only for an acknowledgment that is not a NAK.
    pub async fn transact(&self, transaction: Transaction) -> bool {
        let _in_flight = self.shared.transactions.lock().await;
        let hold = transaction.hold().map(|name| self.hold(name));
        self.lock().session.acknowledgment = None;
        self.send(transaction.into_payload()).await;
        let response = self.wait_for_response(WaitFor::Acknowledgment).await;
        drop(hold);
        match response {
            Some(line) if line.starts_with("NAK") => {
                log::warn!("{} rejected command", self.address());
                false
            }
            Some(_) => true,
            None => {
                log::warn!("{} closed before acknowledging command", self.address());
                false
            }
        }
    }

    // Send raw queries without waiting, keeping them out of any in-flight command
    pub async fn send_queries(&self, queries: Vec<String>) {
        let _in_flight = self.shared.transactions.lock().await;
        for query in queries {
            self.send(query).await;
        }
    }

    // Spawn every command queued by control-list writes
    pub(crate) fn flush_outbox(&self) -> Vec<JoinHandle<bool>> {
        let outbox = std::mem::take(&mut self.lock().session.outbox);
        outbox
            .into_iter()
            .map(|transaction| {
                let backend = self.clone();
                tokio::spawn(async move { backend.transact(transaction).await })
            })
            .collect()
    }
}

async fn read_loop<P: Protocol>(backend: Backend<P>, mut reader: Reader, cancel: CancellationToken) {
    log::debug!("{} read loop started", P::NAME);
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = reader.next() => batch,
        };
        match batch {
            Some(Ok(lines)) => {
                for line in &lines {
                    log::debug!("<--- {}", line);
                }
                backend.lock().parse_batch(&lines);
                backend.signal_response();
            }
            Some(Err(e)) => {
                log::error!("Failed to read from {}: {}", backend.address(), e);
                backend.connection_lost().await;
                break;
            }
            None => {
                log::warn!("{} closed the connection", backend.address());
                backend.connection_lost().await;
                break;
            }
        }
    }
    backend.lock().session.read_enabled = false;
    backend.signal_response();
    log::debug!("{} read loop stopped", P::NAME);
}
