//! Kernel control-plane transport.

#[cfg(target_os = "linux")]
mod netlink;

#[cfg(target_os = "linux")]
pub use netlink::NftConn;

use std::net::Ipv4Addr;

use crate::error::TransportError;
use crate::set::{SetId, SetInfo};

/// SetConn is a blocking connection to the kernel set store.
///
/// Calls are not transactional with each other: elements queued by
/// [`SetConn::add_elements`] only take effect on a successful
/// [`SetConn::flush`].
pub trait SetConn: Send {
    /// Query the kernel for an existing set.
    fn get_set_by_name(&mut self, id: &SetId) -> Result<SetInfo, TransportError>;

    /// Queue IPv4 elements for insertion into a set.
    fn add_elements(&mut self, id: &SetId, elements: &[Ipv4Addr]) -> Result<(), TransportError>;

    /// Commit all queued changes.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Release the connection.
    fn close(&mut self) -> Result<(), TransportError>;
}
