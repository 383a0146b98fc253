pub mod constants;
pub mod types;
pub mod decoder;
pub mod permission;
pub mod transport;
pub mod btle;
#[cfg(feature = "bluest")]
pub mod bluest;
pub mod machine;
