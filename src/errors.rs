use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for every controller operation. Nothing is swallowed:
/// each variant carries enough context (VM name, device identifier, what was
/// being waited on) for the caller to act.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("VM '{vm}' must be {required} to {op} (currently {actual})")]
    StateConflict {
        vm: String,
        op: String,
        required: &'static str,
        actual: String,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("aborted by user: {0}")]
    UserAborted(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("driver failure: {0}")]
    Driver(String),
}

impl VmError {
    pub fn vm_not_found(name: &str) -> Self {
        VmError::NotFound {
            kind: "VM",
            name: name.to_string(),
        }
    }

    pub fn disk_not_found(name: &str) -> Self {
        VmError::NotFound {
            kind: "disk",
            name: name.to_string(),
        }
    }

    pub fn nic_not_found(mac: &str) -> Self {
        VmError::NotFound {
            kind: "interface",
            name: mac.to_string(),
        }
    }
}

impl From<std::io::Error> for VmError {
    fn from(err: std::io::Error) -> Self {
        VmError::Driver(format!("i/o error: {err}"))
    }
}
