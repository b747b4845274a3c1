//! Instrument drivers shipped with the crate.
//!
//! Real drivers live outside this crate and plug in through
//! [`DriverModelProvider`](crate::element::DriverModelProvider) and
//! [`DeviceRegistry::register_driver`](crate::device::DeviceRegistry::register_driver).

pub mod mock;
