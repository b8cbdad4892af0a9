/// Account roles and the subscription-driven transitions between them
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Registered account without a paid membership
    Guest,
    /// Holds (or held until now) a paid membership
    Member,
    /// Administratively assigned
    Coach,
    /// Administratively assigned
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Member => "member",
            Role::Coach => "coach",
            Role::Admin => "admin",
        }
    }

    /// Coach and admin are never touched by subscription state
    pub fn is_administrative(&self) -> bool {
        matches!(self, Role::Coach | Role::Admin)
    }

    /// Role after a successful subscribe or renew
    pub fn after_subscription(self) -> Role {
        match self {
            Role::Guest => Role::Member,
            other => other,
        }
    }

    /// Role once no membership covers the account anymore
    pub fn after_lapse(self) -> Role {
        match self {
            Role::Member => Role::Guest,
            other => other,
        }
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "guest" => Ok(Role::Guest),
            "member" => Ok(Role::Member),
            "coach" => Ok(Role::Coach),
            "admin" => Ok(Role::Admin),
            _ => Err(CoreError::Validation(format!("Invalid role: {}", s))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
