/// Account management
///
/// Credential storage, password hashing, roles and identifier normalization.

mod password;
mod role;
mod store;

pub use password::PasswordHasher;
pub use role::Role;
pub use store::{CredentialStore, NewAccount};

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidateEmail};

/// Normalized login identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Email(String),
    Phone(String),
}

impl Identifier {
    /// Anything containing `@` is treated as an email, everything else as a phone number
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if raw.contains('@') {
            Ok(Identifier::Email(normalize_email(raw)?))
        } else {
            Ok(Identifier::Phone(normalize_phone(raw)?))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Email(value) | Identifier::Phone(value) => value,
        }
    }

    /// Account column holding this kind of identifier
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Identifier::Email(_) => "email",
            Identifier::Phone(_) => "phone_number",
        }
    }
}

/// Trim and lower-case an email, then check its shape
pub fn normalize_email(raw: &str) -> CoreResult<String> {
    let email = raw.trim().to_lowercase();
    if !email.validate_email() {
        return Err(CoreError::Validation("Invalid email format".to_string()));
    }
    Ok(email)
}

/// Strip separators from a phone number. Keeps a leading `+`.
pub fn normalize_phone(raw: &str) -> CoreResult<String> {
    let trimmed = raw.trim();
    let (prefix, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", trimmed),
    };

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => {
                return Err(CoreError::Validation(
                    "Phone number may only contain digits".to_string(),
                ))
            }
        }
    }

    if !(10..=15).contains(&digits.len()) {
        return Err(CoreError::Validation(
            "Phone number must have between 10 and 15 digits".to_string(),
        ));
    }

    Ok(format!("{}{}", prefix, digits))
}

/// Password policy: length is checked by `validator`, composition here
pub fn check_password_policy(password: &str) -> CoreResult<()> {
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(CoreError::Validation(
            "Password must contain at least one digit".to_string(),
        ));
    }
    if !password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace()) {
        return Err(CoreError::Validation(
            "Password must contain at least one special character".to_string(),
        ));
    }
    Ok(())
}

/// Registration request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 100, message = "First name is required"))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100, message = "Last name is required"))]
    pub last_name: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    #[validate(length(min = 8, max = 128, message = "Password must be at least 8 characters"))]
    pub password: String,
    /// Overrides the configured default for email registrations
    pub require_activation: Option<bool>,
}

impl RegisterRequest {
    /// Field validation plus identifier normalization.
    /// Returns the normalized (email, phone) pair.
    pub fn normalized_identifiers(&self) -> CoreResult<(Option<String>, Option<String>)> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        check_password_policy(&self.password)?;

        let email = non_blank(self.email.as_deref())
            .map(normalize_email)
            .transpose()?;
        let phone = non_blank(self.phone_number.as_deref())
            .map(normalize_phone)
            .transpose()?;

        if email.is_none() && phone.is_none() {
            return Err(CoreError::Validation(
                "Either email or phone number is required".to_string(),
            ));
        }

        Ok((email, phone))
    }
}

/// Login request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Email or phone number
    pub identifier: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
    pub ip_address: String,
    pub user_agent: Option<String>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
