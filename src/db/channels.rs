//! `channels` table and the default-channel invariant.
//!
//! At most one row may carry `is_default = 1`. `set_default` clears and sets
//! inside one transaction, as does `create` for a channel inserted as
//! default. The partial unique index `idx_channels_single_default` rejects
//! any commit that would leave two defaults, so racing administrators cannot
//! corrupt the flag. The last committed write wins.

use super::error::{RepoError, RepoResult};
use super::query::{Column, Insert, Patch, Table, Value};
use super::repo::SqlRepository;
use crate::model::{Channel, ChatType};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

pub type ChannelRepository = SqlRepository<Channel>;

const CHANNEL_COLUMNS: &str = "id, chat_id, title, username, chat_type, is_default, \
     last_used_at, added_by, created_at, is_valid, verified_at, error_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelColumn {
    Id,
    ChatId,
    Title,
    Username,
    ChatType,
    IsDefault,
    LastUsedAt,
    AddedBy,
    CreatedAt,
    IsValid,
    VerifiedAt,
    ErrorMessage,
}

impl Column for ChannelColumn {
    const ALL: &'static [Self] = &[
        ChannelColumn::Id,
        ChannelColumn::ChatId,
        ChannelColumn::Title,
        ChannelColumn::Username,
        ChannelColumn::ChatType,
        ChannelColumn::IsDefault,
        ChannelColumn::LastUsedAt,
        ChannelColumn::AddedBy,
        ChannelColumn::CreatedAt,
        ChannelColumn::IsValid,
        ChannelColumn::VerifiedAt,
        ChannelColumn::ErrorMessage,
    ];

    fn name(self) -> &'static str {
        match self {
            ChannelColumn::Id => "id",
            ChannelColumn::ChatId => "chat_id",
            ChannelColumn::Title => "title",
            ChannelColumn::Username => "username",
            ChannelColumn::ChatType => "chat_type",
            ChannelColumn::IsDefault => "is_default",
            ChannelColumn::LastUsedAt => "last_used_at",
            ChannelColumn::AddedBy => "added_by",
            ChannelColumn::CreatedAt => "created_at",
            ChannelColumn::IsValid => "is_valid",
            ChannelColumn::VerifiedAt => "verified_at",
            ChannelColumn::ErrorMessage => "error_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChannel {
    pub chat_id: i64,
    pub title: String,
    pub username: Option<String>,
    pub chat_type: ChatType,
    /// Take the default flag from whichever channel holds it.
    pub is_default: bool,
    pub added_by: Option<i64>,
}

impl NewChannel {
    pub fn new(chat_id: i64, title: impl Into<String>, chat_type: ChatType) -> Self {
        Self {
            chat_id,
            title: title.into(),
            username: None,
            chat_type,
            is_default: false,
            added_by: None,
        }
    }
}

impl Insert for NewChannel {
    type Column = ChannelColumn;

    fn validate(&self) -> RepoResult<()> {
        if self.chat_id == 0 {
            return Err(RepoError::invalid("channel", "chat_id must be set"));
        }
        if self.title.trim().is_empty() {
            return Err(RepoError::invalid("channel", "title must be non-empty"));
        }
        Ok(())
    }

    fn values(&self) -> Vec<(ChannelColumn, Value)> {
        vec![
            (ChannelColumn::ChatId, self.chat_id.into()),
            (ChannelColumn::Title, self.title.clone().into()),
            (ChannelColumn::Username, self.username.clone().into()),
            (ChannelColumn::ChatType, self.chat_type.as_str().into()),
            (ChannelColumn::IsDefault, self.is_default.into()),
            (ChannelColumn::AddedBy, self.added_by.into()),
            (ChannelColumn::CreatedAt, Utc::now().into()),
        ]
    }

    fn apply(&mut self, column: ChannelColumn, value: &Value) -> RepoResult<()> {
        match (column, value) {
            (ChannelColumn::ChatId, Value::Int(v)) => self.chat_id = *v,
            (ChannelColumn::Title, Value::Text(v)) => self.title = v.clone(),
            (ChannelColumn::Username, Value::Text(v)) => self.username = Some(v.clone()),
            (ChannelColumn::Username, Value::Null) => self.username = None,
            (ChannelColumn::AddedBy, Value::Int(v)) => self.added_by = Some(*v),
            (ChannelColumn::AddedBy, Value::Null) => self.added_by = None,
            (ChannelColumn::IsDefault, Value::Bool(v)) => self.is_default = *v,
            (ChannelColumn::ChatType, Value::Text(v)) => {
                self.chat_type = parse_chat_type(v)
                    .ok_or_else(|| RepoError::invalid("channel", "unknown chat type"))?;
            }
            (
                ChannelColumn::ChatId
                | ChannelColumn::Title
                | ChannelColumn::Username
                | ChannelColumn::AddedBy
                | ChannelColumn::ChatType
                | ChannelColumn::IsDefault,
                _,
            ) => return Err(RepoError::invalid("channel", "filter value has the wrong type")),
            _ => return Err(RepoError::invalid("channel", "filter column is not insertable")),
        }
        Ok(())
    }

    /// A new default demotes the old one in the insert transaction.
    fn before_insert(&self) -> Option<&'static str> {
        self.is_default
            .then_some("UPDATE channels SET is_default = 0 WHERE is_default = 1")
    }
}

pub fn parse_chat_type(s: &str) -> Option<ChatType> {
    match s {
        "channel" => Some(ChatType::Channel),
        "group" => Some(ChatType::Group),
        "supergroup" => Some(ChatType::Supergroup),
        "private" => Some(ChatType::Private),
        _ => None,
    }
}

/// The default flag is absent: it only moves via `set_default` or a default
/// insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelPatch {
    pub title: Option<String>,
    pub username: Option<Option<String>>,
    pub chat_type: Option<ChatType>,
}

impl Patch for ChannelPatch {
    type Column = ChannelColumn;

    fn assignments(&self) -> Vec<(ChannelColumn, Value)> {
        let mut out = Vec::new();
        if let Some(v) = &self.title {
            out.push((ChannelColumn::Title, v.clone().into()));
        }
        if let Some(v) = &self.username {
            out.push((ChannelColumn::Username, v.clone().into()));
        }
        if let Some(v) = self.chat_type {
            out.push((ChannelColumn::ChatType, v.as_str().into()));
        }
        out
    }
}

impl Table for Channel {
    const NAME: &'static str = "channels";
    const ENTITY: &'static str = "channel";
    const COLUMNS: &'static str = CHANNEL_COLUMNS;

    type Column = ChannelColumn;
    type New = NewChannel;
    type Patch = ChannelPatch;

    fn id(&self) -> i64 {
        self.id
    }
}

impl SqlRepository<Channel> {
    pub async fn get_by_chat_id(&self, chat_id: i64) -> RepoResult<Option<Channel>> {
        let channel = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE chat_id = ?"
        ))
        .bind(chat_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(channel)
    }

    pub async fn list_all(&self) -> RepoResult<Vec<Channel>> {
        let channels = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(channels)
    }

    /// Make `channel_id` the only default channel.
    #[instrument(skip_all, fields(channel_id = channel_id))]
    pub async fn set_default(&self, channel_id: i64) -> RepoResult<Channel> {
        let mut tx = self.pool().begin().await?;
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            warn!(channel_id, "cannot set default: channel missing");
            return Err(RepoError::not_found("channel", channel_id));
        }
        sqlx::query("UPDATE channels SET is_default = 0 WHERE is_default = 1 AND id != ?")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?;
        let channel = sqlx::query_as::<_, Channel>(&format!(
            "UPDATE channels SET is_default = 1 WHERE id = ? RETURNING {CHANNEL_COLUMNS}"
        ))
        .bind(channel_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, channel_id, "set default failed"))?;
        tx.commit().await?;
        info!(channel_id, chat_id = channel.chat_id, "default channel set");
        Ok(channel)
    }

    /// First channel flagged default, if any.
    pub async fn get_default(&self) -> RepoResult<Option<Channel>> {
        let channel = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE is_default = 1 ORDER BY id LIMIT 1"
        ))
        .fetch_optional(self.pool())
        .await?;
        Ok(channel)
    }

    /// Stamp `last_used_at = now` on the channel with Telegram id `chat_id`.
    #[instrument(skip_all, fields(chat_id = chat_id))]
    pub async fn update_last_used(&self, chat_id: i64) -> RepoResult<()> {
        let mut conn = self.pool().acquire().await?;
        touch_last_used(&mut conn, chat_id, Utc::now()).await
    }

    /// Channels never used, or last used before `older_than`.
    pub async fn get_inactive(&self, older_than: DateTime<Utc>) -> RepoResult<Vec<Channel>> {
        let channels = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels \
             WHERE last_used_at IS NULL OR last_used_at < ? ORDER BY id"
        ))
        .bind(older_than)
        .fetch_all(self.pool())
        .await?;
        Ok(channels)
    }

    #[instrument(skip_all, fields(channel_id = channel_id))]
    pub async fn update_info(
        &self,
        channel_id: i64,
        title: &str,
        username: Option<&str>,
    ) -> RepoResult<Channel> {
        if title.trim().is_empty() {
            return Err(RepoError::invalid("channel", "title must be non-empty"));
        }
        let patch = ChannelPatch {
            title: Some(title.to_string()),
            username: username.map(|u| Some(u.to_string())),
            chat_type: None,
        };
        self.update(channel_id, &patch).await
    }

    /// Store the outcome of an access check. `error` is `None` when the bot
    /// can still post to the channel.
    #[instrument(skip_all, fields(channel_id = channel_id))]
    pub async fn record_check(&self, channel_id: i64, error: Option<&str>) -> RepoResult<Channel> {
        let channel = sqlx::query_as::<_, Channel>(&format!(
            "UPDATE channels SET is_valid = ?, verified_at = ?, error_message = ? \
             WHERE id = ? RETURNING {CHANNEL_COLUMNS}"
        ))
        .bind(error.is_none())
        .bind(Utc::now())
        .bind(error)
        .bind(channel_id)
        .fetch_optional(self.pool())
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, channel_id, "recording check failed"))?;
        match channel {
            Some(channel) => {
                info!(channel_id, valid = channel.is_valid, "channel checked");
                Ok(channel)
            }
            None => Err(RepoError::not_found("channel", channel_id)),
        }
    }

    /// Channels whose last access check failed.
    pub async fn get_invalid(&self) -> RepoResult<Vec<Channel>> {
        let channels = sqlx::query_as::<_, Channel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE is_valid = 0 ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(channels)
    }

    /// Delete non-default channels that failed their last check, then
    /// non-default channels idle since before `older_than`. A channel that
    /// was never used counts as idle from its creation time.
    #[instrument(skip_all)]
    pub async fn prune(&self, older_than: DateTime<Utc>) -> RepoResult<PrunedChannels> {
        let mut tx = self.pool().begin().await?;
        let mut invalid = sqlx::query_as::<_, Channel>(&format!(
            "DELETE FROM channels WHERE is_default = 0 AND is_valid = 0 \
             RETURNING {CHANNEL_COLUMNS}"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let mut inactive = sqlx::query_as::<_, Channel>(&format!(
            "DELETE FROM channels \
             WHERE is_default = 0 AND COALESCE(last_used_at, created_at) < ? \
             RETURNING {CHANNEL_COLUMNS}"
        ))
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, "pruning idle channels failed"))?;
        tx.commit().await?;
        // RETURNING rows come back in no particular order.
        invalid.sort_by_key(|c| c.id);
        inactive.sort_by_key(|c| c.id);
        info!(
            invalid = invalid.len(),
            inactive = inactive.len(),
            "pruned channels"
        );
        Ok(PrunedChannels { invalid, inactive })
    }
}

/// Rows removed by [`SqlRepository::<Channel>::prune`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrunedChannels {
    pub invalid: Vec<Channel>,
    pub inactive: Vec<Channel>,
}

/// Shared with the publish flow, which stamps inside its own transaction.
pub(crate) async fn touch_last_used(
    conn: &mut sqlx::SqliteConnection,
    chat_id: i64,
    at: DateTime<Utc>,
) -> RepoResult<()> {
    let done = sqlx::query("UPDATE channels SET last_used_at = ? WHERE chat_id = ?")
        .bind(at)
        .bind(chat_id)
        .execute(&mut *conn)
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, chat_id, "last-used update failed"))?;
    if done.rows_affected() == 0 {
        warn!(chat_id, "last-used update: channel missing");
        return Err(RepoError::not_found("channel", chat_id));
    }
    Ok(())
}
