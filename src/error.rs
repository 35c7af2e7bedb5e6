//! Error taxonomy shared by the create/gc/resume entry points.

use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Every way a provisioning or lifecycle operation can fail, as surfaced to
/// the caller. The binary renders these as a single JSON error object.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Missing prerequisite config or template. Nothing was allocated.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No addresses or token ids left. Fails before any filesystem or
    /// hypervisor mutation.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Name or disk already exists. Pre-mutation.
    #[error("collision: {0}")]
    Collision(String),

    /// Non-zero exit from an invoked CLI tool. Triggers compensation.
    #[error("external tool failure: {0}")]
    ExternalTool(String),

    /// Rejected or failed at the privileged action gateway.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// An external tool exceeded its time bound. Triggers compensation.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation not valid for the record's current lifecycle state.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for ProvisionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PoolExhausted(what) => ProvisionError::PoolExhausted(what),
            StoreError::DuplicateName(name) => {
                ProvisionError::Collision(format!("VM '{name}' already registered"))
            }
            StoreError::UnknownVm(name) => ProvisionError::NotFound(format!("VM '{name}'")),
            StoreError::InvalidTransition { name, from, to } => ProvisionError::StateConflict(
                format!("VM '{name}' cannot go from {from} to {to}"),
            ),
            other => ProvisionError::Store(other.to_string()),
        }
    }
}
