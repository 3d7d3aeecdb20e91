use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("setup error: {0}")]
    Setup(String),
    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),
    #[error("messaging entity already exists: {0}")]
    EntityAlreadyExists(String),
    #[error("session lock lost: {0}")]
    SessionLockLost(String),
    #[error("no session available: {0}")]
    NoSessionAvailable(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

impl ProbeError {
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, ProbeError::SessionLockLost(_))
    }

    /// Error code carried over the gateway protocol.
    pub fn code(&self) -> &'static str {
        match self {
            ProbeError::Config(_) | ProbeError::Serialization(_) => "BadRequest",
            ProbeError::Setup(_) => "SetupFailed",
            ProbeError::EntityNotFound(_) => "MessagingEntityNotFound",
            ProbeError::EntityAlreadyExists(_) => "MessagingEntityAlreadyExists",
            ProbeError::SessionLockLost(_) => "SessionLockLost",
            ProbeError::NoSessionAvailable(_) => "NoSessionAvailable",
            ProbeError::QuotaExceeded(_) => "QuotaExceeded",
            ProbeError::Broker(_) => "BrokerError",
            ProbeError::Http(_) => "HttpError",
            ProbeError::Runtime(_) => "InternalError",
        }
    }

    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "MessagingEntityNotFound" => ProbeError::EntityNotFound(message),
            "MessagingEntityAlreadyExists" => ProbeError::EntityAlreadyExists(message),
            "SessionLockLost" => ProbeError::SessionLockLost(message),
            "NoSessionAvailable" => ProbeError::NoSessionAvailable(message),
            "QuotaExceeded" => ProbeError::QuotaExceeded(message),
            "Unauthorized" => ProbeError::Http(format!("unauthorized: {message}")),
            _ => ProbeError::Broker(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_lock_lost_classification() {
        let err = ProbeError::Config("x".to_string());
        assert!(format!("{err}").contains("configuration error"));
        assert!(!err.is_lock_lost());
        assert!(ProbeError::SessionLockLost("s".to_string()).is_lock_lost());
    }

    #[test]
    fn codes_map_back_to_variants() {
        let lost = ProbeError::SessionLockLost("gone".to_string());
        let mapped = ProbeError::from_code(lost.code(), "gone".to_string());
        assert!(mapped.is_lock_lost());

        let missing = ProbeError::from_code("MessagingEntityNotFound", "q".to_string());
        assert!(matches!(missing, ProbeError::EntityNotFound(name) if name == "q"));

        let other = ProbeError::from_code("SomethingElse", "boom".to_string());
        assert!(matches!(other, ProbeError::Broker(_)));
    }
}
