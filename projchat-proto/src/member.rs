//! Channel roster entries.

use serde::{Deserialize, Serialize};

use crate::message::UserId;

/// Role of a member within the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Project owner.
    Owner,
    /// Project administrator.
    Admin,
    /// Regular contributor.
    Member,
    /// Read-only participant.
    Viewer,
    /// Any role this client does not know about.
    #[serde(other)]
    Other,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Admin => write!(f, "admin"),
            Self::Member => write!(f, "member"),
            Self::Viewer => write!(f, "viewer"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A roster entry: someone who can be mentioned or shown as typing.
///
/// Immutable for the lifetime of a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Member identifier.
    pub id: UserId,
    /// Display name, also the text used in `@mentions`.
    pub name: String,
    /// Contact email.
    pub email: String,
    /// Avatar image URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Project role.
    pub role: MemberRole,
}
