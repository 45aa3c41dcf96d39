/// Security primitives for identity-service
///
/// - **token**: EdDSA session tokens issued on sign-in
pub mod token;

pub use token::{SessionClaims, TokenIssuer, DEFAULT_TOKEN_TIMEOUT_SECS};
