use thiserror::Error;

/// Main error type for the optimizer
#[derive(Error, Debug)]
pub enum CboError {
    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Duplicate observation: point {point} is already registered")]
    DuplicateObservation { point: String },

    #[error("No observations registered for tag: {tag}")]
    EmptyStore { tag: String },

    #[error("Dimension mismatch: expected {expected} values, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Subscriber {subscriber} is not subscribed to {event}")]
    NotSubscribed { event: String, subscriber: String },

    #[error("Event {event} is not configured on this bus")]
    UnknownEvent { event: String },

    #[error("Unknown tag: {tag}")]
    UnknownTag { tag: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Regressor error: {message}")]
    Regressor { message: String },

    #[error("Objective evaluation failed for tag {tag}: {message}")]
    Evaluation { tag: String, message: String },

    #[error("Subscriber {subscriber} failed: {message}")]
    Subscriber { subscriber: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for optimizer operations
pub type CboResult<T> = Result<T, CboError>;

/// Macro for creating domain errors
#[macro_export]
macro_rules! domain_error {
    ($($arg:tt)*) => {
        $crate::CboError::Domain(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::CboError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CboError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CboError::DimensionMismatch {
            expected: 3,
            actual: 2,
        };

        assert!(error.to_string().contains("Dimension mismatch"));
        assert!(error.to_string().contains('3'));
        assert!(error.to_string().contains('2'));
    }

    #[test]
    fn test_error_conversion() {
        let json_error = serde_json::from_str::<f64>("not a number").unwrap_err();
        let cbo_error: CboError = json_error.into();

        match cbo_error {
            CboError::Serialization(_) => (),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_macros() {
        let domain_err = domain_error!("x = {} lies outside [0, 1]", 1.5);
        assert!(matches!(domain_err, CboError::Domain(_)));
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing required tag: {}", "objective");
        assert!(config_err.to_string().contains("objective"));
    }
}
