//! Remote interfaces, their control connection and their bundles.

use bytes::Bytes;
use futures::future::BoxFuture;
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    mem::take,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
};

use crate::{Connection, HostDevice, State};

/// Invalid bundle id.
pub const BUNDLE_ID_NONE: u8 = u8::MAX;

/// Control protocol spoken with an interface over its control connection.
pub trait ControlProtocol: Send + Sync {
    /// Informs the interface that its cport `cport_id` is active.
    fn connected<'a>(&'a self, connection: &'a Arc<Connection>, cport_id: u16) -> BoxFuture<'a, Result<()>>;

    /// Informs the interface that its cport `cport_id` is inactive.
    fn disconnected<'a>(&'a self, connection: &'a Arc<Connection>, cport_id: u16) -> BoxFuture<'a, Result<()>>;

    /// Size of the interface manifest in bytes.
    fn get_manifest_size<'a>(&'a self, connection: &'a Arc<Connection>) -> BoxFuture<'a, Result<usize>>;

    /// Reads the interface manifest.
    fn get_manifest<'a>(&'a self, connection: &'a Arc<Connection>, size: usize) -> BoxFuture<'a, Result<Bytes>>;

    /// Version of the interface as `(major, minor)`.
    fn get_interface_version<'a>(&'a self, connection: &'a Arc<Connection>) -> BoxFuture<'a, Result<(u8, u8)>>;

    /// Protocol version of bundle `bundle_id` as `(major, minor)`.
    fn get_bundle_version<'a>(
        &'a self, connection: &'a Arc<Connection>, bundle_id: u8,
    ) -> BoxFuture<'a, Result<(u8, u8)>>;
}

/// Parses an interface manifest.
pub trait ManifestParser: Send + Sync {
    /// Parses `manifest`, creating the bundles and connections of `intf`
    /// and filling in its [information](Interface::set_info).
    ///
    /// Returns whether the manifest was valid.
    fn parse(&self, intf: &Arc<Interface>, manifest: &[u8]) -> bool;
}

/// Identification of an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Vendor id.
    pub vendor_id: u32,
    /// Product id.
    pub product_id: u32,
    /// Vendor name.
    pub vendor_string: Option<String>,
    /// Product name.
    pub product_string: Option<String>,
    /// Major interface version.
    pub version_major: u8,
    /// Minor interface version.
    pub version_minor: u8,
}

/// The control connection of an interface.
pub struct Control {
    connection: Arc<Connection>,
    protocol: Arc<dyn ControlProtocol>,
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Control").field(&self.connection).finish()
    }
}

impl Control {
    /// Creates the control connection of `intf`.
    pub fn create(intf: &Arc<Interface>, protocol: Arc<dyn ControlProtocol>) -> Result<Self> {
        let connection = Connection::create_control(intf)?;
        Ok(Self { connection, protocol })
    }

    /// The control connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Whether `connection` is this control connection.
    pub fn is_control_connection(&self, connection: &Connection) -> bool {
        ptr::eq(Arc::as_ptr(&self.connection), connection)
    }

    /// Enables the control connection for transmission.
    pub async fn enable(&self) -> Result<()> {
        tracing::debug!("{}: enabling control", self.connection.name());
        self.connection.enable_tx().await
    }

    /// Disables the control connection.
    pub async fn disable(&self) {
        tracing::debug!("{}: disabling control", self.connection.name());
        self.connection.disable().await
    }

    fn check_enabled(&self) -> Result<()> {
        match self.connection.state() {
            State::Disabled => Err(Error::new(ErrorKind::NotConnected, "control connection is disabled")),
            _ => Ok(()),
        }
    }

    /// Informs the interface that its cport `cport_id` is active.
    pub async fn connected(&self, cport_id: u16) -> Result<()> {
        self.check_enabled()?;
        self.protocol.connected(&self.connection, cport_id).await
    }

    /// Informs the interface that its cport `cport_id` is inactive.
    ///
    /// Fails without contacting the interface if the control connection is disabled.
    pub async fn disconnected(&self, cport_id: u16) -> Result<()> {
        self.check_enabled()?;
        self.protocol.disconnected(&self.connection, cport_id).await
    }
}

/// A remote interface and the connections to it.
pub struct Interface {
    hd: Arc<HostDevice>,
    interface_id: u8,
    boot_over_unipro: AtomicBool,
    disconnected: AtomicBool,
    control: OnceLock<Control>,
    bundles: Mutex<Vec<Arc<Bundle>>>,
    info: Mutex<InterfaceInfo>,
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Interface").field(&self.name()).finish()
    }
}

impl Interface {
    /// Creates the interface `interface_id` on `hd` together with its control connection.
    pub fn create(hd: &Arc<HostDevice>, interface_id: u8, protocol: Arc<dyn ControlProtocol>) -> Result<Arc<Self>> {
        let mut interfaces = hd.interfaces.lock().unwrap();
        if interfaces.iter().any(|intf| intf.interface_id == interface_id) {
            return Err(Error::new(ErrorKind::AlreadyExists, format!("interface {interface_id} already exists")));
        }

        let intf = Arc::new(Self {
            hd: hd.clone(),
            interface_id,
            boot_over_unipro: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            control: OnceLock::new(),
            bundles: Mutex::new(Vec::new()),
            info: Mutex::new(InterfaceInfo::default()),
        });

        let control = Control::create(&intf, protocol)?;
        if intf.control.set(control).is_err() {
            unreachable!("control of new interface already set");
        }

        interfaces.push(intf.clone());
        tracing::debug!("{}: created", intf.name());

        Ok(intf)
    }

    /// Finds interface `interface_id` on `hd`.
    pub fn find(hd: &HostDevice, interface_id: u8) -> Option<Arc<Self>> {
        hd.interfaces.lock().unwrap().iter().find(|intf| intf.interface_id == interface_id).cloned()
    }

    /// Host device.
    pub fn hd(&self) -> &Arc<HostDevice> {
        &self.hd
    }

    /// Interface id.
    pub fn interface_id(&self) -> u8 {
        self.interface_id
    }

    /// Name in the form `bus-interface`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.hd.bus_id(), self.interface_id)
    }

    /// Whether the interface boots over UniPro.
    pub fn boot_over_unipro(&self) -> bool {
        self.boot_over_unipro.load(Ordering::Relaxed)
    }

    /// Sets whether the interface boots over UniPro.
    pub fn set_boot_over_unipro(&self, boot_over_unipro: bool) {
        self.boot_over_unipro.store(boot_over_unipro, Ordering::Relaxed);
    }

    /// Marks the interface as physically gone.
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
    }

    /// Whether the interface is physically gone.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    /// Control of this interface.
    pub fn control(&self) -> Option<&Control> {
        self.control.get()
    }

    /// Bundles of this interface.
    pub fn bundles(&self) -> Vec<Arc<Bundle>> {
        self.bundles.lock().unwrap().clone()
    }

    /// Interface identification.
    pub fn info(&self) -> InterfaceInfo {
        self.info.lock().unwrap().clone()
    }

    /// Sets the interface identification.
    pub fn set_info(&self, info: InterfaceInfo) {
        *self.info.lock().unwrap() = info;
    }

    fn control_or_err(&self) -> Result<&Control> {
        self.control().ok_or_else(|| Error::new(ErrorKind::NotConnected, "interface has no control"))
    }

    /// Enables the control connection, reads and parses the manifest and adds all bundles.
    ///
    /// Bundles that cannot be added are destroyed without failing initialization.
    pub async fn init(self: &Arc<Self>, parser: &dyn ManifestParser) -> Result<()> {
        let control = self.control_or_err()?;
        let name = self.name();

        control.enable().await?;

        let size = match control.protocol.get_manifest_size(&control.connection).await {
            Ok(0) => {
                tracing::error!("{name}: empty manifest");
                return Err(Error::new(ErrorKind::InvalidData, "empty manifest"));
            }
            Ok(size) => size,
            Err(err) => {
                tracing::error!("{name}: failed to get manifest size: {err}");
                return Err(err);
            }
        };

        let manifest = match control.protocol.get_manifest(&control.connection, size).await {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::error!("{name}: failed to get manifest: {err}");
                return Err(err);
            }
        };

        if !parser.parse(self, &manifest) {
            tracing::error!("{name}: failed to parse manifest");
            return Err(Error::new(ErrorKind::InvalidData, "invalid manifest"));
        }

        let (version_major, version_minor) = control.protocol.get_interface_version(&control.connection).await?;
        {
            let mut info = self.info.lock().unwrap();
            info.version_major = version_major;
            info.version_minor = version_minor;
        }

        for bundle in self.bundles() {
            let version = control.protocol.get_bundle_version(&control.connection, bundle.id).await?;
            *bundle.version.lock().unwrap() = version;
        }

        let info = self.info();
        tracing::info!("{name}: interface added: VID=0x{:08x}, PID=0x{:08x}", info.vendor_id, info.product_id);

        for bundle in self.bundles().into_iter().rev() {
            if let Err(err) = bundle.add() {
                tracing::warn!("{}: failed to add bundle: {err}", bundle.name);
                bundle.destroy().await;
            }
        }

        Ok(())
    }

    /// Tears down the interface: destroys all bundles and the control connection.
    pub async fn remove(self: &Arc<Self>) {
        let control = self.control();

        // Avoid talking to an interface that is already gone.
        if self.is_disconnected() {
            if let Some(control) = control {
                control.disable().await;
            }
        }

        let bundles = take(&mut *self.bundles.lock().unwrap());
        for bundle in bundles {
            bundle.destroy().await;
        }

        if let Some(control) = control {
            control.disable().await;
            control.connection.clone().destroy();
        }

        self.hd.interfaces.lock().unwrap().retain(|intf| !Arc::ptr_eq(intf, self));
        tracing::info!("{}: interface removed", self.name());
    }
}

/// A functional group of connections within an interface.
pub struct Bundle {
    intf: Weak<Interface>,
    id: u8,
    class: u8,
    name: String,
    version: Mutex<(u8, u8)>,
    added: AtomicBool,
    pub(crate) connections: Mutex<Vec<Arc<Connection>>>,
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Bundle").field(&self.name).finish()
    }
}

impl Bundle {
    /// Creates bundle `id` of protocol class `class` within `intf`.
    pub fn create(intf: &Arc<Interface>, id: u8, class: u8) -> Result<Arc<Self>> {
        if id == BUNDLE_ID_NONE {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid bundle id"));
        }

        let mut bundles = intf.bundles.lock().unwrap();
        if bundles.iter().any(|bundle| bundle.id == id) {
            return Err(Error::new(ErrorKind::AlreadyExists, format!("bundle {id} already exists")));
        }

        let bundle = Arc::new(Self {
            intf: Arc::downgrade(intf),
            id,
            class,
            name: format!("{}.{id}", intf.name()),
            version: Mutex::new((0, 0)),
            added: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        });
        bundles.push(bundle.clone());

        Ok(bundle)
    }

    /// Interface this bundle belongs to.
    pub fn interface(&self) -> Option<Arc<Interface>> {
        self.intf.upgrade()
    }

    /// Bundle id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Protocol class.
    pub fn class(&self) -> u8 {
        self.class
    }

    /// Name in the form `bus-interface.bundle`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol version reported by the interface.
    pub fn version(&self) -> (u8, u8) {
        *self.version.lock().unwrap()
    }

    /// Connections of this bundle.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().clone()
    }

    /// Creates a connection to cport `cport_id` of the interface.
    pub fn create_connection(self: &Arc<Self>, cport_id: u16) -> Result<Arc<Connection>> {
        Connection::create_dynamic(self, cport_id)
    }

    /// Makes the bundle available to its users.
    pub fn add(&self) -> Result<()> {
        if self.added.swap(true, Ordering::AcqRel) {
            return Err(Error::new(ErrorKind::AlreadyExists, "bundle already added"));
        }

        tracing::debug!("{}: bundle added", self.name);
        Ok(())
    }

    /// Whether the bundle has been added.
    pub fn is_added(&self) -> bool {
        self.added.load(Ordering::Acquire)
    }

    /// Disables and destroys all connections of the bundle and removes it from its interface.
    pub async fn destroy(self: &Arc<Self>) {
        let connections = take(&mut *self.connections.lock().unwrap());
        for connection in connections {
            connection.disable().await;
            connection.destroy();
        }

        if let Some(intf) = self.interface() {
            intf.bundles.lock().unwrap().retain(|bundle| !Arc::ptr_eq(bundle, self));
        }

        tracing::debug!("{}: bundle destroyed", self.name);
    }
}
