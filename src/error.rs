//! Error Taxonomy
//!
//! Validation, conversion, lifecycle, liveness and registration errors
//! shared by every layer of the injector.

use thiserror::Error;

/// Result alias used across the library
pub type InjectorResult<T> = Result<T, InjectorError>;

#[derive(Debug, Error)]
pub enum InjectorError {
    // --- Validation ---
    #[error("attacks format error, tip: check indentation and '-' indicator")]
    AttacksFormat,

    #[error("each attack map of the attack list needs to be a single map")]
    MultiKeyAttackMap,

    #[error("invalid failure definition: {0}")]
    Definition(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("unknown attack kind: {0}")]
    UnknownAttack(String),

    #[error("invalid option '{option}' for attack '{kind}': {reason}")]
    InvalidOption {
        kind: String,
        option: String,
        reason: String,
    },

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    // --- Conversion ---
    #[error("unknown failure state value: {0}")]
    UnknownState(i32),

    // --- Lifecycle ---
    #[error("attack already applied")]
    AlreadyApplied,

    #[error("attack #{index} ({kind}) failed to apply: {source}")]
    AttackFailed {
        index: usize,
        kind: String,
        #[source]
        source: Box<InjectorError>,
    },

    #[error("apply cancelled after {applied} attack(s)")]
    Cancelled { applied: usize },

    #[error("revert failed: {0}")]
    RevertFailed(String),

    #[error("attack runtime error: {0}")]
    Attack(String),

    // --- Liveness / registration ---
    #[error("heartbeat interval must be a positive duration")]
    InvalidInterval,

    #[error("node is not registered on the master")]
    NotRegistered,

    #[error("heartbeat loop is already running")]
    HeartbeatActive,

    #[error("registration rejected: {0}")]
    Registration(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    // --- Failure store ---
    #[error("failure not found: {node_id}/{id}")]
    FailureNotFound { node_id: String, id: String },

    #[error("failure already exists: {node_id}/{id}")]
    DuplicateFailure { node_id: String, id: String },

    #[error("node '{reporter}' does not own failure {node_id}/{id}")]
    NotOwner {
        reporter: String,
        node_id: String,
        id: String,
    },

    // --- Transport ---
    #[error("transport error: {0}")]
    Transport(String),
}

impl InjectorError {
    /// Validation errors are caused by the input and never worth retrying
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            InjectorError::AttacksFormat
                | InjectorError::MultiKeyAttackMap
                | InjectorError::Definition(_)
                | InjectorError::InvalidDuration(_)
                | InjectorError::UnknownAttack(_)
                | InjectorError::InvalidOption { .. }
                | InjectorError::InvalidSelector(_)
                | InjectorError::UnknownState(_)
        )
    }

    pub(crate) fn option(kind: &str, option: &str, reason: impl Into<String>) -> Self {
        InjectorError::InvalidOption {
            kind: kind.to_string(),
            option: option.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_yaml::Error> for InjectorError {
    fn from(err: serde_yaml::Error) -> Self {
        InjectorError::Definition(err.to_string())
    }
}

impl From<reqwest::Error> for InjectorError {
    fn from(err: reqwest::Error) -> Self {
        InjectorError::Transport(err.to_string())
    }
}

impl From<prost::DecodeError> for InjectorError {
    fn from(err: prost::DecodeError) -> Self {
        InjectorError::Transport(format!("malformed message: {}", err))
    }
}
