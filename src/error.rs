use thiserror::Error;

use crate::broker::BrokerError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DroverError>;
