//! Connections between host cports and interface cports.
//!
//! ### Locking
//!
//! * `CONNECTION_MUTEX` serializes creation and destruction of all connections,
//!   making duplicate detection, id reservation and registry insertion atomic.
//! * The registry lock only guards the connection indices.
//! * The per-connection `mutex` serializes [`Connection::enable`] and [`Connection::disable`]
//!   and is held across the calls into the host driver, SVC and control protocol.
//! * The per-connection `lock` guards state, handler and pending operations.
//!   It is never held across an `.await` or a call out of this crate.
//!
//! `CONNECTION_MUTEX` and the per-connection `mutex` never nest.

use std::{
    collections::VecDeque,
    fmt,
    io::{Error, ErrorKind, Result},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use crate::{
    operation::{Operation, RequestHandler},
    Bundle, HostDevice, Interface, CPORT_ID_BAD, SHUTDOWN,
};

pub(crate) mod registry;
mod workqueue;

use workqueue::WorkQueue;

static CONNECTION_MUTEX: Mutex<()> = Mutex::new(());

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No traffic possible.
    Disabled,
    /// Outgoing requests only; incoming requests are refused.
    EnabledTx,
    /// Fully enabled with a request handler installed.
    Enabled,
}

/// Remote end of a non-static connection.
struct Remote {
    intf: Weak<Interface>,
    intf_id: u8,
    bundle: Option<Weak<Bundle>>,
}

struct ConnectionInner {
    state: State,
    handler: Option<RequestHandler>,
    operations: VecDeque<Arc<dyn Operation>>,
    wq: Option<WorkQueue>,
}

/// Bidirectional link between a cport on the host device and a cport on a remote interface.
///
/// A connection also tracks the operations in flight over it.
pub struct Connection {
    hd: Arc<HostDevice>,
    remote: Option<Remote>,
    hd_cport_id: AtomicU16,
    intf_cport_id: u16,
    name: String,
    op_cycle: AtomicU16,
    mutex: tokio::sync::Mutex<()>,
    lock: Mutex<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Connection").field(&self.name).finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!("{}: released", self.name);
    }
}

impl Connection {
    /// Creates a connection.
    ///
    /// `hd_cport_id` requests a specific host cport; `None` picks the lowest free one.
    /// Without `remote` the connection is static and has no peer.
    fn create(
        hd: &Arc<HostDevice>, hd_cport_id: Option<u16>, remote: Option<Remote>, intf_cport_id: u16,
    ) -> Result<Arc<Self>> {
        let (start, end) = match hd_cport_id {
            None => (0, hd.num_cports()),
            Some(id) if id < hd.num_cports() => (id, id + 1),
            Some(id) => {
                tracing::error!("{}: cport {id} not available", hd.name());
                return Err(Error::new(ErrorKind::InvalidInput, format!("cport {id} not available")));
            }
        };
        let intf_id = remote.as_ref().map(|remote| remote.intf_id);

        let _guard = CONNECTION_MUTEX.lock().unwrap();

        if let Some(intf_id) = intf_id {
            if registry::find_by_intf(hd.bus_id(), intf_id, intf_cport_id).is_some() {
                tracing::error!("{}-{intf_id}: cport {intf_cport_id} already in use", hd.bus_id());
                return Err(Error::new(ErrorKind::AlreadyExists, format!("cport {intf_cport_id} already in use")));
            }
        }

        let hd_cport_id = hd.cport_ids().reserve(start, end)?;

        let wq = match WorkQueue::new(format!("{}:{hd_cport_id}", hd.name())) {
            Ok(wq) => wq,
            Err(err) => {
                tracing::error!("{}: cannot create work queue for cport {hd_cport_id}: {err}", hd.name());
                hd.cport_ids().release(hd_cport_id);
                return Err(err);
            }
        };

        let bundle = remote.as_ref().and_then(|remote| remote.bundle.as_ref()).and_then(Weak::upgrade);
        let connection = Arc::new(Self {
            hd: hd.clone(),
            remote,
            hd_cport_id: AtomicU16::new(hd_cport_id),
            intf_cport_id,
            name: format!("{hd_cport_id}/{}:{intf_cport_id}", intf_id.unwrap_or(0)),
            op_cycle: AtomicU16::new(0),
            mutex: tokio::sync::Mutex::new(()),
            lock: Mutex::new(ConnectionInner {
                state: State::Disabled,
                handler: None,
                operations: VecDeque::new(),
                wq: Some(wq),
            }),
        });

        registry::insert(&connection);
        if let Some(bundle) = bundle {
            bundle.connections.lock().unwrap().push(connection.clone());
        }

        tracing::debug!("{}: created", connection.name);
        Ok(connection)
    }

    /// Creates a static connection on host cport `hd_cport_id`.
    ///
    /// Static connections have no remote interface and bypass the SVC and control protocol.
    pub fn create_static(hd: &Arc<HostDevice>, hd_cport_id: u16) -> Result<Arc<Self>> {
        Self::create(hd, Some(hd_cport_id), None, 0)
    }

    /// Creates the control connection of `intf`.
    pub fn create_control(intf: &Arc<Interface>) -> Result<Arc<Self>> {
        let remote = Remote { intf: Arc::downgrade(intf), intf_id: intf.interface_id(), bundle: None };
        Self::create(intf.hd(), None, Some(remote), 0)
    }

    /// Creates a connection to cport `cport_id` of a bundle's interface.
    ///
    /// The connection is added to the connections of the bundle.
    pub fn create_dynamic(bundle: &Arc<Bundle>, cport_id: u16) -> Result<Arc<Self>> {
        let Some(intf) = bundle.interface() else {
            return Err(Error::new(ErrorKind::NotConnected, "interface of bundle is gone"));
        };

        let remote =
            Remote { intf: Arc::downgrade(&intf), intf_id: intf.interface_id(), bundle: Some(Arc::downgrade(bundle)) };
        Self::create(intf.hd(), None, Some(remote), cport_id)
    }

    /// Destroys the connection.
    ///
    /// Unlinks the connection, waits for its work queue to finish and releases its host cport.
    /// The object itself is freed once all other references have been dropped.
    ///
    /// The connection must have been disabled.
    pub fn destroy(self: Arc<Self>) {
        let guard = CONNECTION_MUTEX.lock().unwrap();

        let hd_cport_id = self.hd_cport_id();
        if hd_cport_id == CPORT_ID_BAD {
            tracing::warn!("{}: already destroyed", self.name);
            return;
        }

        if self.state() != State::Disabled {
            tracing::warn!("{}: destroying enabled connection", self.name);
        }

        registry::remove(&self);
        if let Some(bundle) = self.bundle() {
            bundle.connections.lock().unwrap().retain(|connection| !Arc::ptr_eq(connection, &self));
        }

        let wq = self.lock().wq.take();
        if let Some(wq) = wq {
            wq.destroy();
        }

        self.hd.cport_ids().release(hd_cport_id);
        self.hd_cport_id.store(CPORT_ID_BAD, Ordering::Release);

        drop(guard);
        tracing::debug!("{}: destroyed", self.name);
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.lock.lock().unwrap()
    }

    /// Host device.
    pub fn hd(&self) -> &Arc<HostDevice> {
        &self.hd
    }

    /// Host cport id, or [`CPORT_ID_BAD`] once destroyed.
    pub fn hd_cport_id(&self) -> u16 {
        self.hd_cport_id.load(Ordering::Acquire)
    }

    /// Cport id on the remote interface; 0 for static connections.
    pub fn intf_cport_id(&self) -> u16 {
        self.intf_cport_id
    }

    /// Id of the remote interface.
    pub fn intf_id(&self) -> Option<u8> {
        self.remote.as_ref().map(|remote| remote.intf_id)
    }

    /// Remote interface.
    pub fn interface(&self) -> Option<Arc<Interface>> {
        self.remote.as_ref()?.intf.upgrade()
    }

    /// Bundle this connection belongs to.
    pub fn bundle(&self) -> Option<Arc<Bundle>> {
        self.remote.as_ref()?.bundle.as_ref()?.upgrade()
    }

    /// Whether this connection has no remote interface.
    pub fn is_static(&self) -> bool {
        self.remote.is_none()
    }

    /// Name in the form `hd_cport/intf:intf_cport`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether a request handler is installed.
    pub fn has_handler(&self) -> bool {
        self.lock().handler.is_some()
    }

    /// Operations in flight, oldest first.
    pub fn operations(&self) -> Vec<Arc<dyn Operation>> {
        self.lock().operations.iter().cloned().collect()
    }

    /// Next operation id; never zero.
    pub fn next_operation_id(&self) -> u16 {
        loop {
            let id = self.op_cycle.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Registers an operation in flight.
    ///
    /// Outgoing operations need an enabled connection, incoming operations also need
    /// a request handler.
    pub fn add_operation(&self, operation: Arc<dyn Operation>) -> Result<()> {
        let mut inner = self.lock();
        match (inner.state, operation.is_incoming()) {
            (State::Enabled, _) | (State::EnabledTx, false) => (),
            (State::Disabled, false) => return Err(Error::new(ErrorKind::NotConnected, "connection is disabled")),
            (_, true) => return Err(Error::new(SHUTDOWN, "connection does not accept requests")),
        }

        inner.operations.push_back(operation);
        Ok(())
    }

    /// Unregisters a completed or cancelled operation.
    ///
    /// Returns whether it was registered.
    pub fn remove_operation(&self, operation: &Arc<dyn Operation>) -> bool {
        let mut inner = self.lock();
        match inner.operations.iter().position(|op| Arc::ptr_eq(op, operation)) {
            Some(pos) => {
                inner.operations.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Passes an incoming request to the installed request handler.
    pub fn handle_request(&self, operation: &Arc<dyn Operation>) -> Result<()> {
        let handler = self.lock().handler.clone();
        match handler {
            Some(handler) => handler(operation),
            None => Err(Error::new(SHUTDOWN, "no request handler installed")),
        }
    }

    /// Runs `work` on the work queue of this connection.
    ///
    /// Work items run one at a time, in the order they were queued.
    pub fn queue_work(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        match &self.lock().wq {
            Some(wq) => wq.queue(Box::new(work)),
            None => Err(Error::new(ErrorKind::BrokenPipe, "connection destroyed")),
        }
    }

    /// Enables the connection.
    ///
    /// With a `handler` the connection becomes fully [enabled](State::Enabled),
    /// otherwise only [for transmission](State::EnabledTx).
    /// A transmit-only connection is upgraded when a handler is given.
    ///
    /// If enabling fails, everything set up so far is torn down again and the
    /// connection stays [disabled](State::Disabled).
    pub async fn enable(&self, handler: Option<RequestHandler>) -> Result<()> {
        let _mutex = self.mutex.lock().await;

        let state = self.state();
        match state {
            State::Enabled => return Ok(()),
            State::EnabledTx => {
                if let Some(handler) = handler {
                    let mut inner = self.lock();
                    inner.handler = Some(handler);
                    inner.state = State::Enabled;
                    tracing::debug!("{}: receive enabled", self.name);
                }
                return Ok(());
            }
            State::Disabled => (),
        }

        self.hd_cport_enable().await?;

        if let Err(err) = self.svc_connection_create().await {
            self.hd_cport_disable().await;
            return Err(err);
        }

        {
            let mut inner = self.lock();
            inner.state = if handler.is_some() { State::Enabled } else { State::EnabledTx };
            inner.handler = handler;
        }

        if let Err(err) = self.control_connected().await {
            self.shutdown_operations().await;
            self.svc_connection_destroy().await;
            self.hd_cport_disable().await;
            return Err(err);
        }

        tracing::debug!("{}: enabled", self.name);
        Ok(())
    }

    /// Enables the connection for transmission only.
    pub async fn enable_tx(&self) -> Result<()> {
        self.enable(None).await
    }

    /// Stops receiving requests while outgoing operations continue.
    ///
    /// Incoming operations in flight are cancelled.
    /// Does nothing unless the connection is fully [enabled](State::Enabled).
    pub async fn disable_rx(&self) {
        let _mutex = self.mutex.lock().await;

        {
            let mut inner = self.lock();
            if inner.state != State::Enabled {
                return;
            }
            inner.state = State::EnabledTx;
        }

        self.flush_incoming_operations(SHUTDOWN).await;
        self.lock().handler = None;

        tracing::debug!("{}: receive disabled", self.name);
    }

    /// Disables the connection.
    ///
    /// All operations in flight are cancelled.
    /// Always completes; failures of the remote end are only logged.
    pub async fn disable(&self) {
        let _mutex = self.mutex.lock().await;

        if self.state() == State::Disabled {
            return;
        }

        self.control_disconnected().await;
        self.shutdown_operations().await;
        self.svc_connection_destroy().await;
        self.hd_cport_disable().await;

        tracing::debug!("{}: disabled", self.name);
    }

    /// Enables latency tagging; failure is only logged.
    pub async fn latency_tag_enable(&self) {
        if let Err(err) = self.hd.driver().latency_tag_enable(self.hd_cport_id()).await {
            tracing::error!("{}: failed to enable latency tag: {err}", self.name);
        }
    }

    /// Disables latency tagging; failure is only logged.
    pub async fn latency_tag_disable(&self) {
        if let Err(err) = self.hd.driver().latency_tag_disable(self.hd_cport_id()).await {
            tracing::error!("{}: failed to disable latency tag: {err}", self.name);
        }
    }

    /// Marks the connection disabled, cancels all operations and removes the handler.
    async fn shutdown_operations(&self) {
        self.lock().state = State::Disabled;
        self.cancel_operations(SHUTDOWN).await;
        self.lock().handler = None;
    }

    /// Cancels all operations, newest first.
    async fn cancel_operations(&self, error: ErrorKind) {
        loop {
            let operation = self.lock().operations.back().cloned();
            let Some(operation) = operation else { break };

            if operation.is_incoming() {
                operation.cancel_incoming(error).await;
            } else {
                operation.cancel(error).await;
            }
        }
    }

    /// Cancels all incoming operations; outgoing operations are left alone.
    async fn flush_incoming_operations(&self, error: ErrorKind) {
        loop {
            let operation = self.lock().operations.iter().find(|op| op.is_incoming()).cloned();
            let Some(operation) = operation else { break };

            // Cancelled rather than waited for.
            operation.cancel_incoming(error).await;
        }
    }

    async fn hd_cport_enable(&self) -> Result<()> {
        if let Err(err) = self.hd.driver().cport_enable(self.hd_cport_id()).await {
            tracing::error!("{}: failed to enable host cport: {err}", self.hd.name());
            return Err(err);
        }
        Ok(())
    }

    async fn hd_cport_disable(&self) {
        self.hd.driver().cport_disable(self.hd_cport_id()).await;
    }

    /// Requests the SVC to route the host cport to the interface cport.
    async fn svc_connection_create(&self) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }

        let Some(intf) = self.interface() else {
            return Err(Error::new(ErrorKind::NotConnected, "interface is gone"));
        };

        let svc = self.hd.svc();
        let res = svc
            .connection_create(
                svc.ap_intf_id(),
                self.hd_cport_id(),
                intf.interface_id(),
                self.intf_cport_id,
                intf.boot_over_unipro(),
            )
            .await;
        if let Err(err) = res {
            tracing::error!("{}: failed to create svc connection: {err}", self.name);
            return Err(err);
        }

        Ok(())
    }

    async fn svc_connection_destroy(&self) {
        let Some(intf_id) = self.intf_id() else { return };

        let svc = self.hd.svc();
        svc.connection_destroy(svc.ap_intf_id(), self.hd_cport_id(), intf_id, self.intf_cport_id).await;
    }

    /// Informs the interface that its cport is active.
    async fn control_connected(&self) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }

        let Some(intf) = self.interface() else {
            return Err(Error::new(ErrorKind::NotConnected, "interface is gone"));
        };
        let Some(control) = intf.control() else { return Ok(()) };
        if control.is_control_connection(self) {
            return Ok(());
        }

        if let Err(err) = control.connected(self.intf_cport_id).await {
            tracing::error!("{}: failed to connect cport: {err}", self.name);
            return Err(err);
        }

        Ok(())
    }

    /// Informs the interface that its cport is inactive.
    async fn control_disconnected(&self) {
        let Some(intf) = self.interface() else { return };
        let Some(control) = intf.control() else { return };
        if control.is_control_connection(self) {
            return;
        }

        if let Err(err) = control.disconnected(self.intf_cport_id).await {
            tracing::warn!("{}: failed to disconnect cport: {err}", self.name);
        }
    }
}
