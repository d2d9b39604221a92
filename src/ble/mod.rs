//! BLE communication module.
//!
//! This module provides the radio-facing side of the crate: addresses,
//! advertisement decoding, the connection state enum, radio events, and the
//! transport interface with its btleplug and in-memory implementations.

pub mod address;
pub mod advertising;
pub mod connection;
pub mod events;
pub mod mock;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use address::DeviceAddress;
pub use advertising::{Advertisement, AdvertisementInfo, AdvertisementState, ButtonState, ModelId};
pub use connection::ConnectionState;
pub use events::{LocationEvent, PlatformError, RadioEvent, RadioOperation};
pub use mock::MockTransport;
pub use scanner::BtleplugTransport;
pub use transport::{RadioCommand, RadioTransport};
pub use uuids::*;
