//! Error types for the vSphere machine controller
//!
//! Errors carry the identity of the resource and the operation that failed so
//! a single log line is enough to diagnose a failed reconcile. The variants
//! map onto the controller's requeue policy through [`Error::is_retryable`].

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid resource specification
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Namespaced name of the resource with the invalid spec
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Misconfiguration observed while reconciling (e.g. a network device
    /// count that doesn't match the provider, or a malformed BIOS UUID)
    #[error("configuration error for {resource}: {message}")]
    Config {
        /// Namespaced name of the resource
        resource: String,
        /// Description of the mismatch
        message: String,
    },

    /// Virtualization provider call failed
    #[error("provider error [{operation}] for {resource}: {message}")]
    Provider {
        /// Namespaced name of the resource being reconciled
        resource: String,
        /// Provider operation that failed (e.g. "clone", "destroy", "login")
        operation: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Optimistic concurrency check failed while writing a resource
    #[error("conflict patching {resource}: stored version differs from {expected_version}")]
    Conflict {
        /// Namespaced name of the resource
        resource: String,
        /// Resource version the writer held
        expected_version: String,
    },

    /// A provider task reported a state the controller doesn't understand
    #[error("unknown task state {state:?} for task {task_ref} on {resource}")]
    UnexpectedTaskState {
        /// Namespaced name of the resource
        resource: String,
        /// Task reference stored in status
        task_ref: String,
        /// Raw state reported by the provider
        state: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "patch", "session-cache")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a specific resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a specific resource
    pub fn config_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a provider error with the given message
    ///
    /// For simple provider errors without resource context.
    pub fn provider(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            resource: UNKNOWN_CONTEXT.to_string(),
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a provider error with full context
    pub fn provider_for(
        resource: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            resource: resource.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g. unsupported API version)
    pub fn provider_permanent(
        resource: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            resource: resource.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, expected_version: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            expected_version: expected_version.into(),
        }
    }

    /// Create an unexpected task state error
    pub fn unexpected_task_state(
        resource: impl Into<String>,
        task_ref: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self::UnexpectedTaskState {
            resource: resource.into(),
            task_ref: task_ref.into(),
            state: state.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with the provider operation and resource it occurred in
    ///
    /// Provider errors keep their retryable flag; everything else becomes a
    /// retryable provider error carrying the original message.
    pub fn during(self, resource: impl Into<String>, operation: impl Into<String>) -> Self {
        let resource = resource.into();
        let operation = operation.into();
        match self {
            Error::Provider {
                message, retryable, ..
            } => Error::Provider {
                resource,
                operation,
                message,
                retryable,
            },
            other => Error::Provider {
                resource,
                operation,
                message: other.to_string(),
                retryable: true,
            },
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and configuration errors need a spec or environment fix and
    /// are requeued on the slow path. Conflicts are always retryable: the next
    /// reconcile re-reads fresh state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is a conflict and worth retrying; other 4xx are not
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Conflict { .. } => true,
            Error::UnexpectedTaskState { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Returns true if this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Returns true if the underlying API call reported the object missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. }
            | Error::Config { resource, .. }
            | Error::Provider { resource, .. }
            | Error::Conflict { resource, .. }
            | Error::UnexpectedTaskState { resource, .. } => Some(resource),
            Error::Kube { .. } | Error::Serialization { .. } | Error::Internal { .. } => None,
        }
    }
}
