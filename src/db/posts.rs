//! `posts` table: the draft/published lifecycle, archival and tag lookups.

use super::error::{RepoError, RepoResult};
use super::query::{Column, Insert, Patch, Table, Value};
use super::repo::SqlRepository;
use crate::model::{Post, PostStatus};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};

pub type PostRepository = SqlRepository<Post>;

const POST_COLUMNS: &str = "id, title, content, image, tag, username, user_id, created_date, \
     status, published_at, target_chat_id, target_chat_title, message_id, is_archived, \
     archived_at, archived_by, change_username, change_date";

static TAG_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[,\s]+").expect("valid tag separator regex"));

/// Split a raw tag list on commas and whitespace, drop `#` prefixes,
/// lowercase, and join the distinct tokens with single spaces. `None` when
/// nothing is left.
///
/// Tags are stored lowercased because SQLite `LIKE` only folds ASCII case.
pub fn normalize_tags(raw: &str) -> Option<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in TAG_SPLIT_RE.split(raw) {
        let token = token.trim_start_matches('#').to_lowercase();
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostColumn {
    Id,
    Title,
    Content,
    Image,
    Tag,
    Username,
    UserId,
    CreatedDate,
    Status,
    PublishedAt,
    TargetChatId,
    TargetChatTitle,
    MessageId,
    IsArchived,
    ArchivedAt,
    ArchivedBy,
    ChangeUsername,
    ChangeDate,
}

impl Column for PostColumn {
    const ALL: &'static [Self] = &[
        PostColumn::Id,
        PostColumn::Title,
        PostColumn::Content,
        PostColumn::Image,
        PostColumn::Tag,
        PostColumn::Username,
        PostColumn::UserId,
        PostColumn::CreatedDate,
        PostColumn::Status,
        PostColumn::PublishedAt,
        PostColumn::TargetChatId,
        PostColumn::TargetChatTitle,
        PostColumn::MessageId,
        PostColumn::IsArchived,
        PostColumn::ArchivedAt,
        PostColumn::ArchivedBy,
        PostColumn::ChangeUsername,
        PostColumn::ChangeDate,
    ];

    fn name(self) -> &'static str {
        match self {
            PostColumn::Id => "id",
            PostColumn::Title => "title",
            PostColumn::Content => "content",
            PostColumn::Image => "image",
            PostColumn::Tag => "tag",
            PostColumn::Username => "username",
            PostColumn::UserId => "user_id",
            PostColumn::CreatedDate => "created_date",
            PostColumn::Status => "status",
            PostColumn::PublishedAt => "published_at",
            PostColumn::TargetChatId => "target_chat_id",
            PostColumn::TargetChatTitle => "target_chat_title",
            PostColumn::MessageId => "message_id",
            PostColumn::IsArchived => "is_archived",
            PostColumn::ArchivedAt => "archived_at",
            PostColumn::ArchivedBy => "archived_by",
            PostColumn::ChangeUsername => "change_username",
            PostColumn::ChangeDate => "change_date",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewPost {
    pub title: String,
    pub content: String,
    pub image: Option<String>,
    pub tag: Option<String>,
    /// Author Telegram user id.
    pub user_id: i64,
    pub username: Option<String>,
    pub target_chat_id: Option<i64>,
    pub target_chat_title: Option<String>,
}

impl NewPost {
    pub fn new(title: impl Into<String>, content: impl Into<String>, user_id: i64) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            user_id,
            ..Default::default()
        }
    }
}

impl Insert for NewPost {
    type Column = PostColumn;

    fn validate(&self) -> RepoResult<()> {
        if self.title.trim().is_empty() {
            return Err(RepoError::invalid("post", "title must be non-empty"));
        }
        if self.content.trim().is_empty() {
            return Err(RepoError::invalid("post", "content must be non-empty"));
        }
        if self.user_id <= 0 {
            return Err(RepoError::invalid("post", "author user_id must be set"));
        }
        Ok(())
    }

    fn values(&self) -> Vec<(PostColumn, Value)> {
        vec![
            (PostColumn::Title, self.title.trim().into()),
            (PostColumn::Content, self.content.clone().into()),
            (PostColumn::Image, self.image.clone().into()),
            (
                PostColumn::Tag,
                self.tag.as_deref().and_then(normalize_tags).into(),
            ),
            (PostColumn::Username, self.username.clone().into()),
            (PostColumn::UserId, self.user_id.into()),
            (PostColumn::CreatedDate, Utc::now().into()),
            (PostColumn::Status, PostStatus::Draft.as_str().into()),
            (PostColumn::TargetChatId, self.target_chat_id.into()),
            (PostColumn::TargetChatTitle, self.target_chat_title.clone().into()),
            (PostColumn::IsArchived, false.into()),
        ]
    }

    fn apply(&mut self, column: PostColumn, value: &Value) -> RepoResult<()> {
        match (column, value) {
            (PostColumn::Title, Value::Text(v)) => self.title = v.clone(),
            (PostColumn::Content, Value::Text(v)) => self.content = v.clone(),
            (PostColumn::Image, Value::Text(v)) => self.image = Some(v.clone()),
            (PostColumn::Image, Value::Null) => self.image = None,
            (PostColumn::Tag, Value::Text(v)) => self.tag = Some(v.clone()),
            (PostColumn::Tag, Value::Null) => self.tag = None,
            (PostColumn::Username, Value::Text(v)) => self.username = Some(v.clone()),
            (PostColumn::Username, Value::Null) => self.username = None,
            (PostColumn::UserId, Value::Int(v)) => self.user_id = *v,
            (PostColumn::TargetChatId, Value::Int(v)) => self.target_chat_id = Some(*v),
            (PostColumn::TargetChatId, Value::Null) => self.target_chat_id = None,
            (PostColumn::TargetChatTitle, Value::Text(v)) => {
                self.target_chat_title = Some(v.clone())
            }
            (PostColumn::TargetChatTitle, Value::Null) => self.target_chat_title = None,
            (
                PostColumn::Title
                | PostColumn::Content
                | PostColumn::Image
                | PostColumn::Tag
                | PostColumn::Username
                | PostColumn::UserId
                | PostColumn::TargetChatId
                | PostColumn::TargetChatTitle,
                _,
            ) => return Err(RepoError::invalid("post", "filter value has the wrong type")),
            _ => return Err(RepoError::invalid("post", "filter column is not insertable")),
        }
        Ok(())
    }
}

/// Editable post fields. Lifecycle columns (status, archival) only move
/// through the dedicated repository methods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub image: Option<Option<String>>,
    pub tag: Option<Option<String>>,
    pub target_chat_id: Option<Option<i64>>,
    pub target_chat_title: Option<Option<String>>,
}

impl Patch for PostPatch {
    type Column = PostColumn;

    fn assignments(&self) -> Vec<(PostColumn, Value)> {
        let mut out = Vec::new();
        if let Some(v) = &self.title {
            out.push((PostColumn::Title, v.trim().into()));
        }
        if let Some(v) = &self.content {
            out.push((PostColumn::Content, v.clone().into()));
        }
        if let Some(v) = &self.image {
            out.push((PostColumn::Image, v.clone().into()));
        }
        if let Some(v) = &self.tag {
            out.push((PostColumn::Tag, v.as_deref().and_then(normalize_tags).into()));
        }
        if let Some(v) = self.target_chat_id {
            out.push((PostColumn::TargetChatId, v.into()));
        }
        if let Some(v) = &self.target_chat_title {
            out.push((PostColumn::TargetChatTitle, v.clone().into()));
        }
        out
    }
}

impl Table for Post {
    const NAME: &'static str = "posts";
    const ENTITY: &'static str = "post";
    const COLUMNS: &'static str = POST_COLUMNS;

    type Column = PostColumn;
    type New = NewPost;
    type Patch = PostPatch;

    fn id(&self) -> i64 {
        self.id
    }
}

impl SqlRepository<Post> {
    /// Insert a new draft.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_post(
        &self,
        title: &str,
        content: &str,
        image: Option<&str>,
        tag: Option<&str>,
        user_id: i64,
        username: Option<&str>,
        target_chat_id: Option<i64>,
    ) -> RepoResult<Post> {
        let new = NewPost {
            title: title.to_string(),
            content: content.to_string(),
            image: image.map(str::to_string),
            tag: tag.map(str::to_string),
            user_id,
            username: username.map(str::to_string),
            target_chat_id,
            target_chat_title: None,
        };
        self.create(&new).await
    }

    /// Move the post to `published` with `published_at = now`. No target
    /// channel or message id is required.
    #[instrument(skip_all, fields(post_id = id))]
    pub async fn publish(&self, id: i64) -> RepoResult<Post> {
        let post = sqlx::query_as::<_, Post>(&format!(
            "UPDATE posts SET status = ?, published_at = ? WHERE id = ? RETURNING {POST_COLUMNS}"
        ))
        .bind(PostStatus::Published)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, post_id = id, "publish failed"))?;
        expect_row(post, id, "published post")
    }

    /// Record a delivery: message id, target channel and `published_at = now`.
    /// Calling it again overwrites the previous delivery.
    #[instrument(skip_all, fields(post_id = id, chat_id = chat_id))]
    pub async fn mark_published(
        &self,
        id: i64,
        message_id: i64,
        chat_id: i64,
        chat_title: Option<&str>,
    ) -> RepoResult<Post> {
        let mut conn = self.pool().acquire().await?;
        record_publication(&mut conn, id, message_id, chat_id, chat_title, Utc::now()).await
    }

    /// Archive the post. Re-archiving overwrites the stamp and actor.
    #[instrument(skip_all, fields(post_id = id, actor = archived_by))]
    pub async fn archive(&self, id: i64, archived_by: i64) -> RepoResult<Post> {
        let post = sqlx::query_as::<_, Post>(&format!(
            "UPDATE posts SET is_archived = 1, archived_at = ?, archived_by = ? \
             WHERE id = ? RETURNING {POST_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(archived_by)
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, post_id = id, "archive failed"))?;
        expect_row(post, id, "archived post")
    }

    /// Clear the archival fields of an archived post.
    #[instrument(skip_all, fields(post_id = id))]
    pub async fn restore(&self, id: i64) -> RepoResult<Post> {
        let post = sqlx::query_as::<_, Post>(&format!(
            "UPDATE posts SET is_archived = 0, archived_at = NULL, archived_by = NULL \
             WHERE id = ? AND is_archived = 1 RETURNING {POST_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, post_id = id, "restore failed"))?;
        expect_row(post, id, "restored post")
    }

    /// Overwrite every editable field and stamp the editor.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(post_id = id))]
    pub async fn update_post(
        &self,
        id: i64,
        title: &str,
        content: &str,
        image: Option<&str>,
        tag: Option<&str>,
        editor_name: &str,
        edited_at: DateTime<Utc>,
    ) -> RepoResult<Post> {
        if title.trim().is_empty() {
            return Err(RepoError::invalid("post", "title must be non-empty"));
        }
        if content.trim().is_empty() {
            return Err(RepoError::invalid("post", "content must be non-empty"));
        }
        let post = sqlx::query_as::<_, Post>(&format!(
            "UPDATE posts SET title = ?, content = ?, image = ?, tag = ?, \
                 change_username = ?, change_date = ? \
             WHERE id = ? RETURNING {POST_COLUMNS}"
        ))
        .bind(title.trim())
        .bind(content)
        .bind(image)
        .bind(tag.and_then(normalize_tags))
        .bind(editor_name)
        .bind(edited_at)
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, post_id = id, "edit failed"))?;
        expect_row(post, id, "edited post")
    }

    #[instrument(skip_all, fields(post_id = id, chat_id = chat_id))]
    pub async fn update_target_chat(
        &self,
        id: i64,
        chat_id: i64,
        chat_title: Option<&str>,
    ) -> RepoResult<Post> {
        let patch = PostPatch {
            target_chat_id: Some(Some(chat_id)),
            target_chat_title: Some(chat_title.map(str::to_string)),
            ..Default::default()
        };
        self.update(id, &patch).await
    }

    /// Newest `limit` posts by creation time, archived ones included.
    pub async fn latest(&self, limit: i64) -> RepoResult<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts ORDER BY created_date DESC, id DESC LIMIT ?"
        ))
        .bind(limit.max(0))
        .fetch_all(self.pool())
        .await?;
        Ok(posts)
    }

    pub async fn by_author(&self, user_id: i64) -> RepoResult<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE user_id = ? \
             ORDER BY created_date DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(posts)
    }

    /// Posts whose tag list contains `tag` as a whole token, ignoring case
    /// and a leading `#`.
    pub async fn by_tag(&self, tag: &str) -> RepoResult<Vec<Post>> {
        let needle = tag.trim().trim_start_matches('#').to_lowercase();
        if needle.is_empty() || TAG_SPLIT_RE.is_match(&needle) {
            return Ok(Vec::new());
        }
        let escaped = escape_like(&needle);
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts \
             WHERE tag LIKE ?1 ESCAPE '\\' \
                OR tag LIKE ?2 ESCAPE '\\' \
                OR tag LIKE ?3 ESCAPE '\\' \
                OR tag LIKE ?4 ESCAPE '\\' \
             ORDER BY created_date DESC, id DESC"
        ))
        .bind(escaped.clone())
        .bind(format!("{escaped} %"))
        .bind(format!("% {escaped}"))
        .bind(format!("% {escaped} %"))
        .fetch_all(self.pool())
        .await?;
        Ok(posts)
    }

    /// Archived posts, most recently archived first.
    pub async fn archived(&self, limit: i64) -> RepoResult<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE is_archived = 1 \
             ORDER BY archived_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit.max(0))
        .fetch_all(self.pool())
        .await?;
        Ok(posts)
    }

    /// Archived posts written by `user_id`, most recently archived first.
    pub async fn archived_by_user(&self, user_id: i64, limit: i64) -> RepoResult<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE is_archived = 1 AND user_id = ? \
             ORDER BY archived_at DESC, id DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(self.pool())
        .await?;
        Ok(posts)
    }

    pub async fn get_archived(&self, id: i64) -> RepoResult<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE id = ? AND is_archived = 1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(post)
    }
}

fn expect_row(post: Option<Post>, id: i64, what: &str) -> RepoResult<Post> {
    match post {
        Some(post) => {
            info!(post_id = id, "{what}");
            Ok(post)
        }
        None => {
            warn!(post_id = id, "{what}: no matching post");
            Err(RepoError::not_found("post", id))
        }
    }
}

/// Shared with the publish flow, which records inside its own transaction.
pub(crate) async fn record_publication(
    conn: &mut SqliteConnection,
    id: i64,
    message_id: i64,
    chat_id: i64,
    chat_title: Option<&str>,
    at: DateTime<Utc>,
) -> RepoResult<Post> {
    let post = sqlx::query_as::<_, Post>(&format!(
        "UPDATE posts SET status = ?, published_at = ?, message_id = ?, \
             target_chat_id = ?, target_chat_title = COALESCE(?, target_chat_title) \
         WHERE id = ? RETURNING {POST_COLUMNS}"
    ))
    .bind(PostStatus::Published)
    .bind(at)
    .bind(message_id)
    .bind(chat_id)
    .bind(chat_title)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(RepoError::from)
    .inspect_err(|err| warn!(?err, post_id = id, chat_id, "mark published failed"))?;
    expect_row(post, id, "recorded publication")
}
