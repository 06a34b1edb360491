use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the whole cluster runtime
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The declaration asks for more worker processes than the fork budget allows
    #[error("Construction aborted at process '{tag}': {declared} processes declared, fork budget is {budget}")]
    Construction {
        tag: String,
        declared: usize,
        budget: usize,
    },

    /// A worker process or concurrent unit failed to come online or crashed
    #[error("Spawn failed for {target}: {message}")]
    Spawn {
        target: String,
        message: String,
        context: HashMap<String, String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Failure observed while serving a route
    #[error("Route {path} failed: {message}")]
    Route { path: String, message: String },

    /// Serialization errors (configuration parsing, boot data)
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ClusterError {
    /// Create a construction error for an exceeded fork budget
    pub fn construction<S: Into<String>>(tag: S, declared: usize, budget: usize) -> Self {
        Self::Construction {
            tag: tag.into(),
            declared,
            budget,
        }
    }

    /// Create a spawn error
    pub fn spawn<S: Into<String>, M: Into<String>>(target: S, message: M) -> Self {
        Self::Spawn {
            target: target.into(),
            message: message.into(),
            context: HashMap::new(),
            source: None,
        }
    }

    /// Create a spawn error with source
    pub fn spawn_with_source<S, M, E>(target: S, message: M, source: E) -> Self
    where
        S: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Spawn {
            target: target.into(),
            message: message.into(),
            context: HashMap::new(),
            source: Some(Box::new(source)),
        }
    }

    /// Add context to a spawn error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Spawn { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    pub fn route<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::Route {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create a configuration error pointing at a field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Route { .. } => true,
            Self::Spawn { .. } => true, // sibling units keep running
            Self::Construction { .. } | Self::Configuration { .. } | Self::Validation { .. } => {
                false
            }
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Construction { .. } => "construction",
            Self::Spawn { .. } => "spawn",
            Self::Route { .. } => "route",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::Validation { .. } => "validation",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ClusterError>;

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ClusterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for ClusterError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
