//! Supervisory controller (SVC).

use futures::future::BoxFuture;
use std::io::Result;

/// Routes connections between the host device and remote interfaces.
///
/// Every non-static connection needs an SVC route before data can flow.
pub trait Svc: Send + Sync {
    /// Interface id of the application processor (the host side of every route).
    fn ap_intf_id(&self) -> u8;

    /// Creates the route between `cport1_id` on `intf1_id` and `cport2_id` on `intf2_id`.
    fn connection_create(
        &self, intf1_id: u8, cport1_id: u16, intf2_id: u8, cport2_id: u16, boot_over_unipro: bool,
    ) -> BoxFuture<'_, Result<()>>;

    /// Tears down a route created by [`connection_create`](Self::connection_create).
    fn connection_destroy(&self, intf1_id: u8, cport1_id: u16, intf2_id: u8, cport2_id: u16) -> BoxFuture<'_, ()>;
}
