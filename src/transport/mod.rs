//! Transport module - byte stream ownership, device open and discovery.
//!
//! Provides:
//! - [`Transport`] over any `AsyncRead + AsyncWrite` stream, with exact
//!   reads bounded by a timeout and full writes
//! - [`open`] for the phone's serial character device
//! - [`find_device`] for locating that device by USB vendor/product id

mod device;
mod discovery;
mod stream;

pub use device::{open, DeviceStream};
pub use discovery::{find_device, DeviceFilter, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID};
pub use stream::Transport;
