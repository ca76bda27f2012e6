pub mod bitcoin_client;
pub mod block;
pub mod chainview;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod notifier;
pub mod queue;
pub mod test_utils;
pub mod tx_notifier;

pub use error::Error;
