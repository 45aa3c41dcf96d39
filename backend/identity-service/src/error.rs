use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdentityError>;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("User not found")]
    UserNotFound,

    #[error("Social account not found")]
    AccountNotFound,

    #[error("User already exists")]
    UserAlreadyExists,

    #[error("Social account already exists")]
    AccountExists,

    #[error("Username already exists")]
    UsernameAlreadyExists,

    #[error("Provider not supported: {0}")]
    ProviderNotSupported(String),

    #[error("Audience not found for provider: {0}")]
    AudienceNotFound(String),

    #[error("Claim missing: {0}")]
    ClaimMissing(&'static str),

    #[error("Credential verification failed: {0}")]
    VerificationFailed(String),

    #[error("Nonce mismatch")]
    NonceMismatch,

    #[error("Account locked")]
    AccountLocked,

    #[error("Invalid OTP")]
    InvalidOtp,

    #[error("Invalid OAuth state")]
    InvalidOAuthState,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Passkey provider error ({status}): {message}")]
    PasskeyProvider { status: u16, message: String },

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JWT error: {0}")]
    JwtError(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl IdentityError {
    /// Lookup failures: a user or one of its social accounts is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IdentityError::UserNotFound | IdentityError::AccountNotFound
        )
    }

    /// Uniqueness violations
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            IdentityError::UserAlreadyExists
                | IdentityError::AccountExists
                | IdentityError::UsernameAlreadyExists
        )
    }

    /// Authentication failures surfaced to the caller as a rejected sign-in
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            IdentityError::VerificationFailed(_)
                | IdentityError::NonceMismatch
                | IdentityError::AccountLocked
                | IdentityError::InvalidOtp
                | IdentityError::InvalidOAuthState
                | IdentityError::InvalidToken
                | IdentityError::TokenExpired
        )
    }

    /// Failures of the surrounding infrastructure rather than of the input;
    /// the same operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IdentityError::Database(_) | IdentityError::Publish(_) | IdentityError::Internal(_)
        )
    }
}

// Conversions from external error types
impl From<sqlx::Error> for IdentityError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => IdentityError::UserNotFound,
            other => {
                tracing::error!("Database error: {}", other);
                IdentityError::Database(other.to_string())
            }
        }
    }
}

impl From<sqlx::migrate::MigrateError> for IdentityError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        tracing::error!("Migration error: {}", err);
        IdentityError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for IdentityError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!("HTTP client error: {}", err);
        IdentityError::Internal(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for IdentityError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => IdentityError::TokenExpired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature => IdentityError::InvalidToken,
            _ => {
                tracing::error!("JWT error: {}", err);
                IdentityError::JwtError(err.to_string())
            }
        }
    }
}

impl From<ulid::DecodeError> for IdentityError {
    fn from(err: ulid::DecodeError) -> Self {
        IdentityError::InvalidUserId(err.to_string())
    }
}

impl From<validator::ValidationErrors> for IdentityError {
    fn from(err: validator::ValidationErrors) -> Self {
        IdentityError::Validation(err.to_string())
    }
}
