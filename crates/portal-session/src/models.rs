//! Wire types exchanged with the portal API.

use serde::{Deserialize, Serialize};

/// Portal role of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Enrolled learner.
    Student,
    /// Class teacher.
    Teacher,
    /// Portal administrator.
    Admin,
    /// Any role this client does not know about.
    Other(String),
}

impl Role {
    /// Parses a role name case-insensitively.
    fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "student" => Self::Student,
            "teacher" => Self::Teacher,
            "admin" => Self::Admin,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Returns the canonical role name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Student => "Student",
            Self::Teacher => "Teacher",
            Self::Admin => "Admin",
            Self::Other(name) => name,
        }
    }

    /// Returns `true` for roles that must configure a timezone before using
    /// the portal.
    #[must_use]
    pub const fn requires_timezone(&self) -> bool {
        matches!(self, Self::Student | Self::Teacher)
    }
}

/// A payload without a role gets an empty `Other` role, which never routes
/// to timezone setup.
impl Default for Role {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_name(&s))
    }
}

impl Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

/// Role object as embedded in the user payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRole {
    /// The role name.
    #[serde(default)]
    pub role_name: Role,
}

/// Server-confirmed identity of the logged-in user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Server id.
    #[serde(rename = "_id")]
    pub id: String,

    /// Portal role.
    #[serde(default)]
    pub role: UserRole,

    /// Whether the user has completed timezone setup.
    #[serde(default)]
    pub is_timezone_set: bool,

    /// Whether this is the user's first login.
    #[serde(default)]
    pub is_first_login: bool,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Contact email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Configured IANA timezone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl User {
    /// Returns `true` if the user must be sent to timezone setup before
    /// anything else.
    #[must_use]
    pub const fn needs_timezone_setup(&self) -> bool {
        self.role.role_name.requires_timezone() && (!self.is_timezone_set || self.is_first_login)
    }
}

/// Body returned by both bootstrap endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// The authenticated user.
    pub user: User,
    /// A freshly issued token, if the server rotated it.
    #[serde(default)]
    pub token: Option<String>,
}

/// Body returned by the renewal endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewResponse {
    /// The renewed token.
    pub token: String,
}

/// Body sent to the renewal endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewRequest {
    /// Stored user id.
    pub user_id: String,
    /// Stored device id.
    pub device_id: String,
}

/// Body sent to the device sync endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDeviceRequest {
    /// Stored device id.
    pub device_id: String,
}
