use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Published,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Published => "published",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChatType {
    Channel,
    Group,
    Supergroup,
    Private,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Channel => "channel",
            ChatType::Group => "group",
            ChatType::Supergroup => "supergroup",
            ChatType::Private => "private",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RoleType {
    Admin,
    ContentManager,
}

impl RoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Admin => "admin",
            RoleType::ContentManager => "content_manager",
        }
    }

    /// Accepts the stored names plus the spellings operators tend to type.
    pub fn parse_role(s: &str) -> Option<RoleType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrator" => Some(RoleType::Admin),
            "content_manager" | "content-manager" | "contentmanager" | "manager" | "cm" => {
                Some(RoleType::ContentManager)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AuditAction {
    Add,
    Remove,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Add => "add",
            AuditAction::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct User {
    pub id: i64,
    /// Telegram user id.
    pub user_id: i64,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct UserRole {
    pub user_id: i64,
    pub role_type: RoleType,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<i64>,
}

/// One grant or revoke. Rows are never rewritten; `user_id` becomes `None`
/// only when the user it pointed at is deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct RoleAudit {
    pub id: i64,
    pub user_id: Option<i64>,
    pub role_type: RoleType,
    pub action: AuditAction,
    pub performed_by: i64,
    pub performed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Channel {
    pub id: i64,
    /// Telegram chat id.
    pub chat_id: i64,
    pub title: String,
    pub username: Option<String>,
    pub chat_type: ChatType,
    pub is_default: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub added_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Outcome of the last access check; new channels start valid.
    pub is_valid: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub image: Option<String>,
    /// Space separated tag tokens.
    pub tag: Option<String>,
    /// Author display name.
    pub username: Option<String>,
    /// Author Telegram user id.
    pub user_id: i64,
    pub created_date: DateTime<Utc>,
    pub status: PostStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub target_chat_id: Option<i64>,
    pub target_chat_title: Option<String>,
    pub message_id: Option<i64>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub archived_by: Option<i64>,
    pub change_username: Option<String>,
    pub change_date: Option<DateTime<Utc>>,
}

impl Post {
    pub fn is_published(&self) -> bool {
        self.status == PostStatus::Published
    }

    pub fn tags(&self) -> Vec<&str> {
        self.tag
            .as_deref()
            .map(|t| t.split_whitespace().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_aliases() {
        assert_eq!(RoleType::parse_role("Admin"), Some(RoleType::Admin));
        assert_eq!(
            RoleType::parse_role("content-manager"),
            Some(RoleType::ContentManager)
        );
        assert_eq!(RoleType::parse_role("owner"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PostStatus::Published).unwrap(),
            "\"published\""
        );
        assert_eq!(RoleType::ContentManager.as_str(), "content_manager");
    }
}
