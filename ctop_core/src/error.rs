use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::cpuid::leaf_name;

/// Error type for every stage of a topology query
#[derive(Debug, Error)]
pub enum TopologyError {
    /// CPUID is missing, or does not reach a leaf the query needs
    #[error("CPUID leaf {} ({required:#x}) unsupported (maximum leaf: {})", leaf_name(*.required), fmt_max(*.max))]
    IdentificationUnsupported { required: u32, max: Option<u32> },

    /// Brand string leaves are blank, unterminated, or carry no frequency
    #[error("Malformed brand string: {reason}")]
    MalformedBrandString { reason: String },

    /// Cache descriptor reported a type outside data/instruction/unified
    #[error("Unknown cache type {value} in sub-leaf {subleaf} of leaf {}", leaf_name(crate::cpuid::leaf::CACHE_PARAMETERS))]
    UnknownCacheType { subleaf: u32, value: u32 },

    /// A decoded field or sub-leaf sequence violates its documented layout
    #[error("Error using CPUID leaf {} ({leaf:#x}): {reason}", leaf_name(*.leaf))]
    MalformedTopology { leaf: u32, reason: String },

    /// NUMA subsystem failure, optionally tied to one node
    #[error("NUMA error{}: {reason}", fmt_node(*.node))]
    Numa { node: Option<u32>, reason: String },

    /// Two OS CPUs of the same node reported one hardware id
    #[error("NUMA node {node}: CPUs {first_cpu} and {second_cpu} share hardware topology id {hardware_id:#x}")]
    DuplicateTopologyId {
        node: u32,
        hardware_id: u32,
        first_cpu: u32,
        second_cpu: u32,
    },

    /// Independently derived counts disagree
    #[error("Cross-validation failed: {reason}")]
    CrossValidation { reason: String },

    /// Configuration could not be applied
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Configuration file has a bad line
    #[error("Invalid configuration file {path}, line {line}: {reason}")]
    ConfigInvalid {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Reading a configuration file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn fmt_max(max: Option<u32>) -> String {
    match max {
        Some(m) => format!("{m:#x}"),
        None => "none".to_string(),
    }
}

fn fmt_node(node: Option<u32>) -> String {
    match node {
        Some(n) => format!(" (node {n})"),
        None => String::new(),
    }
}

impl TopologyError {
    pub fn unsupported(required: u32, max: Option<u32>) -> Self {
        TopologyError::IdentificationUnsupported { required, max }
    }

    pub fn brand(reason: impl Into<String>) -> Self {
        TopologyError::MalformedBrandString {
            reason: reason.into(),
        }
    }

    pub fn topology(leaf: u32, reason: impl Into<String>) -> Self {
        TopologyError::MalformedTopology {
            leaf,
            reason: reason.into(),
        }
    }

    /// Create a machine-wide NUMA error
    pub fn numa(reason: impl Into<String>) -> Self {
        TopologyError::Numa {
            node: None,
            reason: reason.into(),
        }
    }

    /// Create a NUMA error scoped to one node
    pub fn numa_node(node: u32, reason: impl Into<String>) -> Self {
        TopologyError::Numa {
            node: Some(node),
            reason: reason.into(),
        }
    }

    pub fn cross_validation(reason: impl Into<String>) -> Self {
        TopologyError::CrossValidation {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        TopologyError::Config {
            message: message.into(),
        }
    }

    pub fn config_invalid(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        TopologyError::ConfigInvalid {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    /// True when two independently derived sources disagreed
    pub fn is_cross_validation(&self) -> bool {
        matches!(
            self,
            TopologyError::CrossValidation { .. } | TopologyError::DuplicateTopologyId { .. }
        )
    }

    /// Node the failure is attributed to, if any
    pub fn node(&self) -> Option<u32> {
        match self {
            TopologyError::Numa { node, .. } => *node,
            TopologyError::DuplicateTopologyId { node, .. } => Some(*node),
            _ => None,
        }
    }
}

/// Result type alias for topology queries
pub type Result<T> = std::result::Result<T, TopologyError>;
