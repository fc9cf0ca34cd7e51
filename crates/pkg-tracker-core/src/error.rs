use std::fmt;

use crate::carriers::CarrierError;

/// Main error type for pkg-tracker
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (SQLx wrapped)
    Database(sqlx::Error),

    /// Bad input shape or out-of-range values
    Validation(String),

    /// Shipment/email/link missing
    NotFound(String),

    /// Tracking-number uniqueness violated
    Duplicate(String),

    /// Manual refresh inside cooldown without force; carries seconds remaining
    Cooldown { retry_after_secs: i64 },

    /// Carrier adapter failures (typed taxonomy, consulted by the updater)
    Carrier(CarrierError),

    /// Mailbox / email pipeline errors
    Email(String),

    /// HTTP/Network errors outside the carrier taxonomy
    Network(String),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Duplicate(msg) => write!(f, "Duplicate: {}", msg),
            Error::Cooldown { retry_after_secs } => {
                write!(f, "Refresh cooldown active, retry in {}s", retry_after_secs)
            }
            Error::Carrier(e) => write!(f, "Carrier error: {}", e),
            Error::Email(msg) => write!(f, "Email error: {}", msg),
            Error::Network(msg) => write!(f, "Network error: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Network(error.to_string())
    }
}

impl From<CarrierError> for Error {
    fn from(error: CarrierError) -> Self {
        Error::Carrier(error)
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new duplicate error
    pub fn duplicate<T: Into<String>>(msg: T) -> Self {
        Error::Duplicate(msg.into())
    }

    /// Create a new email pipeline error
    pub fn email<T: Into<String>>(msg: T) -> Self {
        Error::Email(msg.into())
    }

    /// Create a new network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        Error::Network(msg.into())
    }
}

impl Error {
    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Duplicate(_) => 409,
            Error::Cooldown { .. } => 429,
            Error::Carrier(e) => e.status_code(),
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Email(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Network(_) => 503,
            Error::Other(_) => 500,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Duplicate(_) => "duplicate",
            Error::Cooldown { .. } => "cooldown",
            Error::Carrier(_) => "carrier",
            Error::Email(_) => "email",
            Error::Network(_) => "network",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("bad").status_code(), 400);
        assert_eq!(Error::not_found("gone").status_code(), 404);
        assert_eq!(Error::duplicate("1Z").status_code(), 409);
        assert_eq!(Error::Cooldown { retry_after_secs: 42 }.status_code(), 429);
    }

    #[test]
    fn test_categories() {
        assert_eq!(Error::config("x").category(), "config");
        assert_eq!(Error::email("x").category(), "email");
    }
}
