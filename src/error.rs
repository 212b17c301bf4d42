use thiserror::Error;

/// Crate-wide error type covering registry access, configuration,
/// topology loading and execution host control.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Execution host error: {0}")]
    Host(String),

    #[error("Workload error: {0}")]
    Workload(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SchedulerError {
    /// Walk the source chain down to the innermost cause and return its
    /// message. Registry records store this rather than the outermost
    /// wrapper so that operators see the actual failure.
    pub fn innermost_message(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        while let Some(source) = current.source() {
            current = source;
        }
        current.to_string()
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "disk quota exceeded")
        }
    }

    impl std::error::Error for Inner {}

    #[derive(Debug)]
    struct Outer(Inner);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "workflow step aborted")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_innermost_message_unwraps_chain() {
        let err = SchedulerError::Workload(Box::new(Outer(Inner)));
        assert_eq!(err.innermost_message(), "disk quota exceeded");
    }

    #[test]
    fn test_innermost_message_without_source() {
        let err = SchedulerError::Host("sandbox went away".to_string());
        assert_eq!(err.innermost_message(), "Execution host error: sandbox went away");
    }
}
