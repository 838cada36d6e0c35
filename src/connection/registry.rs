//! Registry of live connections.
//!
//! Indexed by host cport for data delivery and by remote interface cport
//! for duplicate detection. Both indices change together under one lock.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, Mutex},
};

use super::Connection;
use crate::HostDevice;

static CONNECTIONS: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::default()));

#[derive(Default)]
struct Registry {
    /// (bus id, host cport id)
    by_hd: HashMap<(u32, u16), Arc<Connection>>,
    /// (bus id, interface id, interface cport id) to host cport id
    by_intf: HashMap<(u32, u8, u16), u16>,
}

/// Publishes a connection in both indices.
pub(crate) fn insert(connection: &Arc<Connection>) {
    let bus_id = connection.hd().bus_id();
    let hd_cport_id = connection.hd_cport_id();

    let mut registry = CONNECTIONS.lock().unwrap();
    registry.by_hd.insert((bus_id, hd_cport_id), connection.clone());
    if let Some(intf_id) = connection.intf_id() {
        registry.by_intf.insert((bus_id, intf_id, connection.intf_cport_id()), hd_cport_id);
    }
}

/// Unlinks a connection from both indices.
pub(crate) fn remove(connection: &Connection) {
    let bus_id = connection.hd().bus_id();

    let removed = {
        let mut registry = CONNECTIONS.lock().unwrap();
        if let Some(intf_id) = connection.intf_id() {
            registry.by_intf.remove(&(bus_id, intf_id, connection.intf_cport_id()));
        }
        registry.by_hd.remove(&(bus_id, connection.hd_cport_id()))
    };

    // The registry reference is released outside the lock.
    drop(removed);
}

/// Looks up a connection by host cport.
///
/// The returned reference was taken while the registry was locked,
/// so the connection stays valid even if it is destroyed concurrently.
pub(crate) fn find_by_hd(hd: &HostDevice, cport_id: u16) -> Option<Arc<Connection>> {
    CONNECTIONS.lock().unwrap().by_hd.get(&(hd.bus_id(), cport_id)).cloned()
}

/// Looks up a connection by remote interface cport.
///
/// Caller holds the connection mutex.
pub(crate) fn find_by_intf(bus_id: u32, intf_id: u8, cport_id: u16) -> Option<Arc<Connection>> {
    let registry = CONNECTIONS.lock().unwrap();
    let hd_cport_id = registry.by_intf.get(&(bus_id, intf_id, cport_id))?;
    registry.by_hd.get(&(bus_id, *hd_cport_id)).cloned()
}
