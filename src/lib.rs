//! Greybus host core.
//!
//! Manages the bidirectional cport connections between a local [host device](hd::HostDevice)
//! and the [interfaces](interface::Interface) of remote modules.
//!
//! The transport driver, the supervisory controller (SVC), the control protocol spoken
//! with each interface, the manifest parser and the operation layer are external.
//! They are plugged in through the traits [`HostDriver`](hd::HostDriver), [`Svc`](svc::Svc),
//! [`ControlProtocol`](interface::ControlProtocol), [`ManifestParser`](interface::ManifestParser)
//! and [`OperationLayer`](operation::OperationLayer).
//!
//! All errors are reported as [`std::io::Error`].

pub mod connection;
pub mod hd;
pub mod id_map;
pub mod interface;
pub mod operation;
pub mod svc;

pub use connection::{Connection, State};
pub use hd::{HostConfig, HostDevice, HostDriver};
pub use interface::{Bundle, Control, ControlProtocol, Interface, InterfaceInfo, ManifestParser};
pub use operation::{Operation, OperationLayer, RequestHandler};
pub use svc::Svc;

/// Marks a released or unused cport id.
pub const CPORT_ID_BAD: u16 = u16::MAX;

/// Largest cport id a host device may expose.
pub const CPORT_ID_MAX: u16 = 4095;

/// Size of the operation message header; smallest usable host buffer.
pub const MESSAGE_SIZE_MIN: usize = 8;

/// Largest operation message.
pub const MESSAGE_SIZE_MAX: usize = u16::MAX as usize;

/// Error kind used when operations are cancelled because their connection shuts down.
pub const SHUTDOWN: std::io::ErrorKind = std::io::ErrorKind::ConnectionAborted;
