use ethers::types::Address;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy of a deployment run.
///
/// Only `Connection` and `GasEstimation` are transient; everything else
/// aborts the active step immediately.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("gas estimation failed: {0}")]
    GasEstimation(String),

    #[error("contract deployment failed: {0}")]
    ContractDeployment(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("orphaned selectors: facet {facet} is planned at both {first:?} and {second:?}")]
    OrphanedSelectors {
        facet: String,
        first: Address,
        second: Address,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("artifact error: {0}")]
    Artifact(String),
}

impl Error {
    /// Retry classifier: whether the retry policy may re-attempt the
    /// failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::GasEstimation(_))
    }

    /// Marks a transient error as final once the retry budget is spent.
    /// The attempt count stays in the message so the caller can see the
    /// budget that was exhausted.
    pub fn after_attempts(self, label: &str, attempts: u32) -> Error {
        match self {
            Error::Connection(msg) => {
                Error::Connection(format!("{label} gave up after {attempts} attempts: {msg}"))
            }
            Error::GasEstimation(msg) => {
                Error::GasEstimation(format!("{label} gave up after {attempts} attempts: {msg}"))
            }
            other => other,
        }
    }
}
