pub mod adapter;
pub mod bluez;
pub mod decoder;
#[cfg(test)]
pub mod fake;
pub mod session;

pub use adapter::{BleAdapter, BleError};
pub use bluez::BluezAdapter;
pub use session::{ScaleSession, StartOutcome};
