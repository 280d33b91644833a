//! Error types for the reconciliation engine.

use thiserror::Error;

/// Errors that can occur while reconciling hypervisor resources.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// A name lookup missed. Recoverable: drives the create branch.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// A CIDR or IP literal could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `qemu-img create` exited non-zero.
    #[error("Volume creation failed ({status}): {command}")]
    VolumeCreationFailed { command: String, status: i32 },

    /// The volume handle no longer refers to a live volume.
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// The ISO authoring tool exited non-zero.
    #[error("Cloud-init packaging failed ({status}): {command}")]
    PackagingFailed { command: String, status: i32 },

    /// The hypervisor rejected the domain XML.
    #[error("Failed to define domain: {reason}")]
    DomainDefinitionFailed { reason: String, xml: String },

    /// The domain is defined but could not be booted.
    #[error("Failed to start domain: {0}")]
    DomainStartFailed(String),

    /// Teardown was requested for a domain the hypervisor does not know.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// The operation is intentionally unsupported.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// MAC generation kept colliding with existing interfaces.
    #[error("MAC allocation exhausted after {attempts} attempts")]
    AllocationExhausted { attempts: usize },

    /// An external program could not be spawned at all.
    #[error("Failed to run {program}: {reason}")]
    CommandFailed { program: String, reason: String },

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other hypervisor-side failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// Build a lookup miss for the given resource kind.
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    /// True when the error is a lookup miss rather than a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::VolumeNotFound(_) | Self::InstanceNotFound(_)
        )
    }
}

/// Hypervisor-side object kinds, used to tag lookup misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Domain,
    Network,
    StoragePool,
    StorageVolume,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Domain => "Domain",
            Self::Network => "Network",
            Self::StoragePool => "Storage pool",
            Self::StorageVolume => "Storage volume",
        };
        f.write_str(s)
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
