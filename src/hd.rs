//! Host device.

use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::{
    connection::registry, id_map::IdMap, operation::OperationLayer, svc::Svc, Interface, State, CPORT_ID_MAX,
    MESSAGE_SIZE_MAX, MESSAGE_SIZE_MIN,
};

static NEXT_BUS_ID: AtomicU32 = AtomicU32::new(1);

/// Low-level transport driver of a host device.
///
/// All callbacks are optional and succeed by default.
pub trait HostDriver: Send + Sync {
    /// Enables the host cport.
    fn cport_enable(&self, _cport_id: u16) -> BoxFuture<'_, Result<()>> {
        future::ok(()).boxed()
    }

    /// Disables the host cport.
    fn cport_disable(&self, _cport_id: u16) -> BoxFuture<'_, ()> {
        future::ready(()).boxed()
    }

    /// Enables latency tagging on the host cport.
    fn latency_tag_enable(&self, _cport_id: u16) -> BoxFuture<'_, Result<()>> {
        future::ok(()).boxed()
    }

    /// Disables latency tagging on the host cport.
    fn latency_tag_disable(&self, _cport_id: u16) -> BoxFuture<'_, Result<()>> {
        future::ok(()).boxed()
    }
}

/// Host device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of cports provided by the host device.
    pub num_cports: u16,
    /// Largest buffer the host device can transfer.
    pub buffer_size_max: usize,
}

impl HostConfig {
    /// Creates a configuration for a host device with `num_cports` cports.
    pub const fn new(num_cports: u16) -> Self {
        Self { num_cports, buffer_size_max: MESSAGE_SIZE_MAX }
    }

    /// Sets the largest buffer the host device can transfer.
    #[must_use]
    pub const fn with_buffer_size_max(mut self, buffer_size_max: usize) -> Self {
        self.buffer_size_max = buffer_size_max;
        self
    }
}

/// The local end of all connections: a host controller driving the bus.
pub struct HostDevice {
    bus_id: u32,
    config: HostConfig,
    driver: Arc<dyn HostDriver>,
    svc: Arc<dyn Svc>,
    operations: Arc<dyn OperationLayer>,
    cport_ids: Mutex<IdMap>,
    pub(crate) interfaces: Mutex<Vec<Arc<Interface>>>,
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostDevice").field("bus_id", &self.bus_id).field("config", &self.config).finish()
    }
}

impl HostDevice {
    /// Creates a host device.
    ///
    /// Fails if the number of cports is zero or exceeds [`CPORT_ID_MAX`] + 1, or if the
    /// buffer size is smaller than [`MESSAGE_SIZE_MIN`].
    /// A buffer size larger than [`MESSAGE_SIZE_MAX`] is clamped.
    pub fn new(
        mut config: HostConfig, driver: Arc<dyn HostDriver>, svc: Arc<dyn Svc>, operations: Arc<dyn OperationLayer>,
    ) -> Result<Arc<Self>> {
        if config.num_cports == 0 || config.num_cports > CPORT_ID_MAX + 1 {
            return Err(Error::new(ErrorKind::InvalidInput, format!("invalid number of cports: {}", config.num_cports)));
        }

        if config.buffer_size_max < MESSAGE_SIZE_MIN {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("buffer size too small: {}", config.buffer_size_max),
            ));
        }

        if config.buffer_size_max > MESSAGE_SIZE_MAX {
            tracing::warn!("limiting buffer size to {MESSAGE_SIZE_MAX}");
            config.buffer_size_max = MESSAGE_SIZE_MAX;
        }

        let bus_id = NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("greybus{bus_id}: created with {} cports", config.num_cports);

        Ok(Arc::new(Self {
            bus_id,
            config,
            driver,
            svc,
            operations,
            cport_ids: Mutex::new(IdMap::new(config.num_cports)),
            interfaces: Mutex::new(Vec::new()),
        }))
    }

    /// Process-unique bus id.
    pub fn bus_id(&self) -> u32 {
        self.bus_id
    }

    /// Device name.
    pub fn name(&self) -> String {
        format!("greybus{}", self.bus_id)
    }

    /// Number of cports.
    pub fn num_cports(&self) -> u16 {
        self.config.num_cports
    }

    /// Largest buffer the host device can transfer.
    pub fn buffer_size_max(&self) -> usize {
        self.config.buffer_size_max
    }

    /// Transport driver.
    pub fn driver(&self) -> &Arc<dyn HostDriver> {
        &self.driver
    }

    /// Supervisory controller.
    pub fn svc(&self) -> &Arc<dyn Svc> {
        &self.svc
    }

    /// Operation layer receiving incoming data.
    pub fn operations(&self) -> &Arc<dyn OperationLayer> {
        &self.operations
    }

    pub(crate) fn cport_ids(&self) -> MutexGuard<'_, IdMap> {
        self.cport_ids.lock().unwrap()
    }

    /// Number of cport ids currently in use.
    pub fn cports_in_use(&self) -> usize {
        self.cport_ids().used()
    }

    /// Interfaces currently present on this host device.
    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.interfaces.lock().unwrap().clone()
    }

    /// Removes all interfaces.
    pub async fn interfaces_remove(&self) {
        let interfaces = self.interfaces();
        for intf in interfaces {
            intf.remove().await;
        }
    }

    /// Data received on host cport `cport_id`.
    ///
    /// Called by the transport driver from its delivery context.
    /// Data for an unknown or disabled connection is dropped.
    pub fn data_rcvd(&self, cport_id: u16, data: &[u8]) {
        let Some(connection) = registry::find_by_hd(self, cport_id) else {
            tracing::error!("{}: nonexistent connection ({} bytes dropped)", self.name(), data.len());
            return;
        };

        if connection.state() == State::Disabled {
            tracing::warn!("{}: dropping {} received bytes", connection.name(), data.len());
            return;
        }

        #[cfg(feature = "trace-data")]
        tracing::trace!("{}: received {} bytes", connection.name(), data.len());

        self.operations.recv(&connection, data);
    }
}
