//! [`Driver`](crate::Driver) implementations.

pub mod sim;
#[cfg(feature = "spdk")]
pub mod spdk;
