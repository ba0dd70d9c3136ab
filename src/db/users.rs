use super::error::{RepoError, RepoResult};
use super::query::{Column, Insert, Patch, Table, Value};
use super::repo::SqlRepository;
use crate::model::{RoleType, User};
use chrono::Utc;
use tracing::{info, instrument};

pub type UserRepository = SqlRepository<User>;

const USER_COLUMNS: &str = "id, user_id, username, full_name, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserColumn {
    Id,
    UserId,
    Username,
    FullName,
    CreatedAt,
    UpdatedAt,
}

impl Column for UserColumn {
    const ALL: &'static [Self] = &[
        UserColumn::Id,
        UserColumn::UserId,
        UserColumn::Username,
        UserColumn::FullName,
        UserColumn::CreatedAt,
        UserColumn::UpdatedAt,
    ];

    fn name(self) -> &'static str {
        match self {
            UserColumn::Id => "id",
            UserColumn::UserId => "user_id",
            UserColumn::Username => "username",
            UserColumn::FullName => "full_name",
            UserColumn::CreatedAt => "created_at",
            UserColumn::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewUser {
    pub user_id: i64,
    pub username: Option<String>,
    pub full_name: Option<String>,
}

impl Insert for NewUser {
    type Column = UserColumn;

    fn validate(&self) -> RepoResult<()> {
        if self.user_id <= 0 {
            return Err(RepoError::invalid("user", "user_id must be positive"));
        }
        Ok(())
    }

    fn values(&self) -> Vec<(UserColumn, Value)> {
        let now = Utc::now();
        vec![
            (UserColumn::UserId, self.user_id.into()),
            (UserColumn::Username, self.username.clone().into()),
            (UserColumn::FullName, self.full_name.clone().into()),
            (UserColumn::CreatedAt, now.into()),
            (UserColumn::UpdatedAt, now.into()),
        ]
    }

    fn apply(&mut self, column: UserColumn, value: &Value) -> RepoResult<()> {
        match (column, value) {
            (UserColumn::UserId, Value::Int(v)) => self.user_id = *v,
            (UserColumn::Username, Value::Text(v)) => self.username = Some(v.clone()),
            (UserColumn::Username, Value::Null) => self.username = None,
            (UserColumn::FullName, Value::Text(v)) => self.full_name = Some(v.clone()),
            (UserColumn::FullName, Value::Null) => self.full_name = None,
            (UserColumn::UserId | UserColumn::Username | UserColumn::FullName, _) => {
                return Err(RepoError::invalid("user", "filter value has the wrong type"))
            }
            _ => return Err(RepoError::invalid("user", "filter column is not insertable")),
        }
        Ok(())
    }
}

/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPatch {
    pub username: Option<Option<String>>,
    pub full_name: Option<Option<String>>,
}

impl Patch for UserPatch {
    type Column = UserColumn;

    fn assignments(&self) -> Vec<(UserColumn, Value)> {
        let mut out = Vec::new();
        if let Some(v) = &self.username {
            out.push((UserColumn::Username, v.clone().into()));
        }
        if let Some(v) = &self.full_name {
            out.push((UserColumn::FullName, v.clone().into()));
        }
        if !out.is_empty() {
            out.push((UserColumn::UpdatedAt, Utc::now().into()));
        }
        out
    }
}

impl Table for User {
    const NAME: &'static str = "users";
    const ENTITY: &'static str = "user";
    const COLUMNS: &'static str = USER_COLUMNS;

    type Column = UserColumn;
    type New = NewUser;
    type Patch = UserPatch;

    fn id(&self) -> i64 {
        self.id
    }
}

impl SqlRepository<User> {
    /// Insert the user, or refresh its names. Absent names keep the stored
    /// value.
    #[instrument(skip_all, fields(user_id = user_id))]
    pub async fn upsert(
        &self,
        user_id: i64,
        username: Option<&str>,
        full_name: Option<&str>,
    ) -> RepoResult<User> {
        if user_id <= 0 {
            return Err(RepoError::invalid("user", "user_id must be positive"));
        }
        let now = Utc::now();
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (user_id, username, full_name, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
                 username = COALESCE(excluded.username, users.username), \
                 full_name = COALESCE(excluded.full_name, users.full_name), \
                 updated_at = excluded.updated_at \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(username)
        .bind(full_name)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        info!(user_id, "upserted user");
        Ok(user)
    }

    pub async fn get_by_user_id(&self, user_id: i64) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(user)
    }

    /// Case-insensitive lookup ignoring a leading `@`. An exact match wins;
    /// otherwise the oldest user whose name contains the query.
    pub async fn get_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        let needle = username.trim().trim_start_matches('@').to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE instr(lower(username), ?1) > 0 \
             ORDER BY (lower(username) = ?1) DESC, id ASC \
             LIMIT 1"
        ))
        .bind(&needle)
        .fetch_optional(self.pool())
        .await?;
        Ok(user)
    }

    pub async fn get_by_role(&self, role: RoleType) -> RepoResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT u.id, u.user_id, u.username, u.full_name, u.created_at, u.updated_at \
             FROM users u JOIN user_roles r ON r.user_id = u.user_id \
             WHERE r.role_type = ? ORDER BY u.id",
        )
        .bind(role)
        .fetch_all(self.pool())
        .await?;
        Ok(users)
    }
}
