use thiserror::Error;

use crate::discovery::DiscoveryPhase;

/// Failure of a single oracle call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    /// Timeouts, rate limits, dropped connections, unparseable output that may
    /// succeed on another attempt.
    #[error("transient oracle failure: {0}")]
    Transient(String),

    /// Refusals, client errors, or a transient failure that exhausted its retries.
    #[error("permanent oracle failure: {0}")]
    Permanent(String),
}

impl OracleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Transient(_))
    }

    /// Escalate to `Permanent`, keeping the message.
    pub fn into_permanent(self) -> Self {
        match self {
            OracleError::Transient(msg) => OracleError::Permanent(msg),
            permanent => permanent,
        }
    }
}

/// Run-level failures. Document failures never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema discovery failed during {phase} pass: {source}")]
    SchemaDiscovery {
        phase: DiscoveryPhase,
        #[source]
        source: OracleError,
    },

    #[error("schema discovery produced an unusable {phase} schema: {reason}")]
    UnusableSchema {
        phase: DiscoveryPhase,
        reason: String,
    },

    #[error("corpus contains no documents")]
    EmptyCorpus,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
