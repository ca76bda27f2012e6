pub mod client;
pub mod error;
pub mod mock;
pub mod types;

pub use client::BitcoinRpc;
pub use error::Error;
