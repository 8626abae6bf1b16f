//! Error types for vm-route-forge
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the VM key, command line or address involved so a
//! single log line is enough to locate the failing reconciliation.

use thiserror::Error;

/// Main error type for route synchronization
#[derive(Debug, Error)]
pub enum Error {
    /// A string could not be parsed as an IP address
    #[error("invalid IP address {value:?}: {message}")]
    InvalidAddress {
        /// The offending value
        value: String,
        /// Parser message
        message: String,
    },

    /// A string could not be parsed as a CIDR block
    #[error("invalid CIDR {value:?}: {message}")]
    InvalidCidr {
        /// The offending value
        value: String,
        /// Parser message
        message: String,
    },

    /// An iproute2 invocation failed
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Rendered command line
        command: String,
        /// Stderr output or spawn error
        message: String,
    },

    /// Output from the kernel could not be interpreted
    #[error("parse error [{context}]: {message}")]
    Parse {
        /// What was being parsed (route, rule, key)
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The node hosting a VM has no overlay address yet
    #[error("node {node:?} has no CiliumInternalIP address")]
    MissingNodeAddress {
        /// Node name, empty when the node record itself is unknown
        node: String,
    },

    /// Startup of a component failed; the engine must not run degraded
    #[error("setup error [{context}]: {message}")]
    Setup {
        /// Component that failed to start (e.g. "netlink-watcher")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The selected backend exists only as a placeholder
    #[error("{feature} is not implemented")]
    NotImplemented {
        /// Name of the missing feature
        feature: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "queue")
        context: String,
    },
}

impl Error {
    /// Create an invalid address error
    pub fn invalid_address(value: impl Into<String>, msg: impl ToString) -> Self {
        Self::InvalidAddress {
            value: value.into(),
            message: msg.to_string(),
        }
    }

    /// Create an invalid CIDR error
    pub fn invalid_cidr(value: impl Into<String>, msg: impl ToString) -> Self {
        Self::InvalidCidr {
            value: value.into(),
            message: msg.to_string(),
        }
    }

    /// Create a command failure error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a parse error
    pub fn parse(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a missing node address error
    pub fn missing_node_address(node: impl Into<String>) -> Self {
        Self::MissingNodeAddress { node: node.into() }
    }

    /// Create a setup error with component context
    pub fn setup(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Setup {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a not-implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Setup and not-implemented errors are fatal; everything else is
    /// treated as transient and retried through the work queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Setup { .. } | Error::NotImplemented { .. })
    }
}
