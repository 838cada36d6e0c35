#![allow(dead_code)]

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use std::{
    io::{Error, ErrorKind, Result},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Once, Weak,
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use greybus::{
    Bundle, Connection, ControlProtocol, HostConfig, HostDevice, HostDriver, Interface, InterfaceInfo, ManifestParser,
    Operation, OperationLayer, Svc,
};

pub const AP_INTF_ID: u8 = 1;

pub fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
        tracing_log::LogTracer::init().unwrap();
    });
}

/// Calls made into the external layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CportEnable(u16),
    CportDisable(u16),
    LatencyTagEnable(u16),
    LatencyTagDisable(u16),
    SvcCreate { cport: u16, intf_id: u8, intf_cport: u16, boot_over_unipro: bool },
    SvcDestroy { cport: u16, intf_id: u8, intf_cport: u16 },
    Connected(u16),
    Disconnected(u16),
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|event| f(event)).count()
    }
}

#[derive(Default)]
pub struct MockDriver {
    pub events: EventLog,
    pub fail_cport_enable: AtomicBool,
    pub fail_latency_tag: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
}

impl HostDriver for MockDriver {
    fn cport_enable(&self, cport_id: u16) -> BoxFuture<'_, Result<()>> {
        async move {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            if self.fail_cport_enable.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::Other, "cport enable failed"));
            }
            self.events.push(Event::CportEnable(cport_id));
            Ok(())
        }
        .boxed()
    }

    fn cport_disable(&self, cport_id: u16) -> BoxFuture<'_, ()> {
        async move { self.events.push(Event::CportDisable(cport_id)) }.boxed()
    }

    fn latency_tag_enable(&self, cport_id: u16) -> BoxFuture<'_, Result<()>> {
        async move {
            self.events.push(Event::LatencyTagEnable(cport_id));
            match self.fail_latency_tag.load(Ordering::SeqCst) {
                true => Err(Error::new(ErrorKind::Unsupported, "no latency tag")),
                false => Ok(()),
            }
        }
        .boxed()
    }

    fn latency_tag_disable(&self, cport_id: u16) -> BoxFuture<'_, Result<()>> {
        async move {
            self.events.push(Event::LatencyTagDisable(cport_id));
            match self.fail_latency_tag.load(Ordering::SeqCst) {
                true => Err(Error::new(ErrorKind::Unsupported, "no latency tag")),
                false => Ok(()),
            }
        }
        .boxed()
    }
}

#[derive(Default)]
pub struct MockSvc {
    pub events: EventLog,
    pub fail_create: AtomicBool,
}

impl Svc for MockSvc {
    fn ap_intf_id(&self) -> u8 {
        AP_INTF_ID
    }

    fn connection_create(
        &self, intf1_id: u8, cport1_id: u16, intf2_id: u8, cport2_id: u16, boot_over_unipro: bool,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            assert_eq!(intf1_id, AP_INTF_ID);
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::ConnectionRefused, "svc refused connection"));
            }
            self.events.push(Event::SvcCreate {
                cport: cport1_id,
                intf_id: intf2_id,
                intf_cport: cport2_id,
                boot_over_unipro,
            });
            Ok(())
        }
        .boxed()
    }

    fn connection_destroy(&self, intf1_id: u8, cport1_id: u16, intf2_id: u8, cport2_id: u16) -> BoxFuture<'_, ()> {
        async move {
            assert_eq!(intf1_id, AP_INTF_ID);
            self.events.push(Event::SvcDestroy { cport: cport1_id, intf_id: intf2_id, intf_cport: cport2_id });
        }
        .boxed()
    }
}

/// Records all received data.
#[derive(Default)]
pub struct MockOperations {
    pub received: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl OperationLayer for MockOperations {
    fn recv(&self, connection: &Arc<Connection>, data: &[u8]) {
        self.received.lock().unwrap().push((connection.hd_cport_id(), data.to_vec()));
    }
}

/// An operation that removes itself from its connection when cancelled or completed.
pub struct MockOperation {
    this: Weak<MockOperation>,
    connection: Weak<Connection>,
    incoming: bool,
    cancelled: Mutex<Option<ErrorKind>>,
    completes: Mutex<Option<Arc<MockOperation>>>,
}

impl MockOperation {
    pub fn new(connection: &Arc<Connection>, incoming: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            connection: Arc::downgrade(connection),
            incoming,
            cancelled: Mutex::new(None),
            completes: Mutex::new(None),
        })
    }

    /// Creates the operation and registers it with the connection.
    pub fn submit(connection: &Arc<Connection>, incoming: bool) -> Result<Arc<Self>> {
        let op = Self::new(connection, incoming);
        connection.add_operation(op.clone())?;
        Ok(op)
    }

    pub fn as_dyn(&self) -> Arc<dyn Operation> {
        self.this.upgrade().unwrap()
    }

    /// Completes the operation normally.
    pub fn complete(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.remove_operation(&self.as_dyn());
        }
    }

    /// Completes `other` as well when this operation is cancelled.
    pub fn complete_on_cancel(&self, other: &Arc<MockOperation>) {
        *self.completes.lock().unwrap() = Some(other.clone());
    }

    pub fn cancelled(&self) -> Option<ErrorKind> {
        *self.cancelled.lock().unwrap()
    }

    async fn finish(&self, error: ErrorKind) {
        tokio::task::yield_now().await;
        *self.cancelled.lock().unwrap() = Some(error);
        self.complete();

        let other = self.completes.lock().unwrap().take();
        if let Some(other) = other {
            other.complete();
        }
    }
}

impl Operation for MockOperation {
    fn is_incoming(&self) -> bool {
        self.incoming
    }

    fn cancel(&self, error: ErrorKind) -> BoxFuture<'_, ()> {
        assert!(!self.incoming, "outgoing cancel of incoming operation");
        self.finish(error).boxed()
    }

    fn cancel_incoming(&self, error: ErrorKind) -> BoxFuture<'_, ()> {
        assert!(self.incoming, "incoming cancel of outgoing operation");
        self.finish(error).boxed()
    }
}

pub struct TestHost {
    pub hd: Arc<HostDevice>,
    pub driver: Arc<MockDriver>,
    pub svc: Arc<MockSvc>,
    pub operations: Arc<MockOperations>,
    pub events: EventLog,
}

pub fn host(num_cports: u16) -> TestHost {
    let events = EventLog::default();
    let driver = Arc::new(MockDriver { events: events.clone(), ..Default::default() });
    let svc = Arc::new(MockSvc { events: events.clone(), ..Default::default() });
    let operations = Arc::new(MockOperations::default());
    let hd = HostDevice::new(HostConfig::new(num_cports), driver.clone(), svc.clone(), operations.clone())
        .expect("cannot create host device");
    TestHost { hd, driver, svc, operations, events }
}

pub struct MockControl {
    pub events: EventLog,
    pub fail_connected: AtomicBool,
    pub fail_disconnected: AtomicBool,
    pub manifest: Bytes,
    pub version: (u8, u8),
}

impl MockControl {
    pub fn new(events: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            events: events.clone(),
            fail_connected: AtomicBool::new(false),
            fail_disconnected: AtomicBool::new(false),
            manifest: Bytes::from_static(b"TEST MANIFEST"),
            version: (0, 1),
        })
    }

    pub fn with_manifest(events: &EventLog, manifest: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            events: events.clone(),
            fail_connected: AtomicBool::new(false),
            fail_disconnected: AtomicBool::new(false),
            manifest: Bytes::from_static(manifest),
            version: (0, 1),
        })
    }
}

impl ControlProtocol for MockControl {
    fn connected<'a>(&'a self, connection: &'a Arc<Connection>, cport_id: u16) -> BoxFuture<'a, Result<()>> {
        async move {
            assert_eq!(connection.intf_cport_id(), 0, "control request on non-control connection");
            if self.fail_connected.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::TimedOut, "no response"));
            }
            self.events.push(Event::Connected(cport_id));
            Ok(())
        }
        .boxed()
    }

    fn disconnected<'a>(&'a self, _connection: &'a Arc<Connection>, cport_id: u16) -> BoxFuture<'a, Result<()>> {
        async move {
            self.events.push(Event::Disconnected(cport_id));
            match self.fail_disconnected.load(Ordering::SeqCst) {
                true => Err(Error::new(ErrorKind::TimedOut, "no response")),
                false => Ok(()),
            }
        }
        .boxed()
    }

    fn get_manifest_size<'a>(&'a self, _connection: &'a Arc<Connection>) -> BoxFuture<'a, Result<usize>> {
        async move { Ok(self.manifest.len()) }.boxed()
    }

    fn get_manifest<'a>(&'a self, _connection: &'a Arc<Connection>, size: usize) -> BoxFuture<'a, Result<Bytes>> {
        async move {
            assert_eq!(size, self.manifest.len());
            Ok(self.manifest.clone())
        }
        .boxed()
    }

    fn get_interface_version<'a>(&'a self, _connection: &'a Arc<Connection>) -> BoxFuture<'a, Result<(u8, u8)>> {
        async move { Ok(self.version) }.boxed()
    }

    fn get_bundle_version<'a>(
        &'a self, _connection: &'a Arc<Connection>, bundle_id: u8,
    ) -> BoxFuture<'a, Result<(u8, u8)>> {
        async move { Ok((1, bundle_id)) }.boxed()
    }
}

/// Creates the bundles and cports it is configured with.
pub struct MockParser {
    pub info: InterfaceInfo,
    /// (bundle id, class, cport ids)
    pub bundles: Vec<(u8, u8, Vec<u16>)>,
}

impl ManifestParser for MockParser {
    fn parse(&self, intf: &Arc<Interface>, manifest: &[u8]) -> bool {
        if manifest.is_empty() || manifest.starts_with(b"BAD") {
            return false;
        }

        intf.set_info(self.info.clone());
        for (id, class, cports) in &self.bundles {
            let Ok(bundle) = Bundle::create(intf, *id, *class) else { return false };
            for cport in cports {
                if bundle.create_connection(*cport).is_err() {
                    return false;
                }
            }
        }

        true
    }
}
