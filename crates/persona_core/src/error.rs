use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("identity not found: {message}")]
    IdentityNotFound { message: String },
    #[error("invalid interval: {message}")]
    InvalidInterval { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
}

impl PersonaError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn identity_not_found(message: impl Into<String>) -> Self {
        Self::IdentityNotFound {
            message: message.into(),
        }
    }

    pub fn invalid_interval(message: impl Into<String>) -> Self {
        Self::InvalidInterval {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Only a refused lock is worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type PersonaResult<T> = Result<T, PersonaError>;

impl From<sea_orm::DbErr> for PersonaError {
    fn from(value: sea_orm::DbErr) -> Self {
        PersonaError::storage(value.to_string())
    }
}

impl From<serde_json::Error> for PersonaError {
    fn from(value: serde_json::Error) -> Self {
        PersonaError::storage(format!("json: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::PersonaError;

    #[test]
    fn helper_constructors_set_variants() {
        let err = PersonaError::storage("disk");
        assert!(matches!(err, PersonaError::Storage { .. }));
        let err = PersonaError::not_found("missing");
        assert!(matches!(err, PersonaError::NotFound { .. }));
        let err = PersonaError::validation("bad");
        assert!(matches!(err, PersonaError::Validation { .. }));
        let err = PersonaError::identity_not_found("who");
        assert!(matches!(err, PersonaError::IdentityNotFound { .. }));
        let err = PersonaError::invalid_interval("backwards");
        assert!(matches!(err, PersonaError::InvalidInterval { .. }));
        let err = PersonaError::conflict("locked");
        assert!(matches!(err, PersonaError::Conflict { .. }));
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(PersonaError::conflict("locked").is_retryable());
        assert!(!PersonaError::identity_not_found("who").is_retryable());
        assert!(!PersonaError::invalid_interval("backwards").is_retryable());
    }
}
