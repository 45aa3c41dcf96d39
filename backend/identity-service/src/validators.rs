use once_cell::sync::Lazy;
use regex::Regex;
use validator::{Validate, ValidationError};

/// Input validation utilities for identity service

static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._-]{3,32}$")
        .expect("hardcoded username regex is invalid - fix source code")
});

static OTP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{6}$").expect("hardcoded otp regex is invalid - fix source code"));

/// Validate username format (3-32 characters, alphanumeric with `.`, `-` and `_`)
pub fn validate_username(username: &str) -> bool {
    USERNAME_REGEX.is_match(username)
}

/// validator crate compatible custom validator for username shape
pub fn validate_username_shape_validator(username: &str) -> Result<(), ValidationError> {
    if validate_username(username) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_username"))
    }
}

/// One-time passwords are exactly six ASCII digits
pub fn validate_otp(otp: &str) -> bool {
    OTP_REGEX.is_match(otp)
}

/// Username derived from an email address: its local part
pub fn username_from_email(email: &str) -> Option<&str> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Some(local),
        _ => None,
    }
}

/// Explicit registration input
#[derive(Debug, Clone, Validate)]
pub struct Registration {
    #[validate(custom(function = "validate_username_shape_validator"))]
    pub username: String,

    #[validate(length(min = 1, max = 128))]
    pub name: String,

    #[validate(email)]
    pub email: String,
}
