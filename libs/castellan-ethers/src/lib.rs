pub mod contracts;
pub mod tx_sender;

pub use tx_sender::{DeployerMiddleware, EthersClient};
