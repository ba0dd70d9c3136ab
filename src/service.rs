//! Flows that combine the repositories with Telegram: registering and
//! re-checking channels, publishing a post, and deciding who may do what.

use crate::db::channels::{touch_last_used, ChannelPatch, NewChannel};
use crate::db::posts::record_publication;
use crate::db::{
    ChannelRepository, Pool, PostRepository, PrunedChannels, RepoError, RoleRepository,
};
use crate::model::{Channel, Post, RoleType};
use crate::telegram::{render_post_text, ChatGateway, GatewayError};
use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("post {0} is archived")]
    Archived(i64),
    #[error("no target channel: pass a chat id or set a default channel")]
    NoTarget,
    #[error("bot cannot post in chat {0}")]
    CannotPost(i64),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Clone)]
pub struct ChannelService {
    channels: ChannelRepository,
    gateway: Arc<dyn ChatGateway>,
}

impl ChannelService {
    pub fn new(pool: Pool, gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            channels: ChannelRepository::new(pool),
            gateway,
        }
    }

    /// Verify the bot can post in `chat_id`, then store it as a channel.
    #[instrument(skip_all, fields(chat_id = chat_id))]
    pub async fn register(
        &self,
        chat_id: i64,
        added_by: i64,
        make_default: bool,
    ) -> ServiceResult<Channel> {
        let access = self.gateway.inspect_chat(chat_id).await?;
        if !access.can_post {
            warn!(chat_id, "bot lacks post rights");
            return Err(ServiceError::CannotPost(chat_id));
        }
        let channel = self
            .channels
            .create(&NewChannel {
                chat_id,
                title: access.title,
                username: access.username,
                chat_type: access.chat_type,
                is_default: make_default,
                added_by: Some(added_by),
            })
            .await?;
        info!(chat_id, channel_id = channel.id, make_default, "channel registered");
        Ok(channel)
    }

    /// Re-inspect one stored channel and record whether the bot can still
    /// post there.
    pub async fn verify(&self, chat_id: i64) -> ServiceResult<ChannelCheck> {
        let channel = self
            .channels
            .get_by_chat_id(chat_id)
            .await?
            .ok_or_else(|| RepoError::not_found("channel", chat_id))?;
        self.check(channel).await
    }

    /// [`verify`](Self::verify) every stored channel. A failed check is
    /// recorded on the row and reported, never returned as an error.
    #[instrument(skip_all)]
    pub async fn verify_all(&self) -> ServiceResult<Vec<ChannelCheck>> {
        let mut checks = Vec::new();
        for channel in self.channels.list_all().await? {
            checks.push(self.check(channel).await?);
        }
        let failed = checks.iter().filter(|c| c.outcome.is_failed()).count();
        info!(total = checks.len(), failed, "channels verified");
        Ok(checks)
    }

    /// Remove invalid channels and channels idle for `inactive_days`. The
    /// default channel is always kept.
    pub async fn cleanup(&self, inactive_days: i64) -> ServiceResult<PrunedChannels> {
        let cutoff = Utc::now() - Duration::days(inactive_days);
        Ok(self.channels.prune(cutoff).await?)
    }

    #[instrument(skip_all, fields(chat_id = channel.chat_id))]
    async fn check(&self, channel: Channel) -> ServiceResult<ChannelCheck> {
        let (outcome, error) = match self.gateway.inspect_chat(channel.chat_id).await {
            Ok(access) if access.can_post => {
                if access.title != channel.title || access.username != channel.username {
                    let patch = ChannelPatch {
                        title: Some(access.title),
                        username: Some(access.username),
                        chat_type: None,
                    };
                    self.channels.update(channel.id, &patch).await?;
                    (CheckOutcome::Updated, None)
                } else {
                    (CheckOutcome::Verified, None)
                }
            }
            Ok(_) => {
                let reason = ServiceError::CannotPost(channel.chat_id).to_string();
                (CheckOutcome::Failed(reason.clone()), Some(reason))
            }
            Err(err) => {
                warn!(?err, "channel check failed");
                let reason = err.to_string();
                (CheckOutcome::Failed(reason.clone()), Some(reason))
            }
        };
        let channel = self
            .channels
            .record_check(channel.id, error.as_deref())
            .await?;
        Ok(ChannelCheck { channel, outcome })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Verified,
    /// Title or username changed on Telegram and was copied over.
    Updated,
    Failed(String),
}

impl CheckOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CheckOutcome::Failed(_))
    }
}

/// A channel after its check, with what the check found.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelCheck {
    pub channel: Channel,
    pub outcome: CheckOutcome,
}

#[derive(Clone)]
pub struct PublishService {
    pool: Pool,
    posts: PostRepository,
    channels: ChannelRepository,
    gateway: Arc<dyn ChatGateway>,
}

impl PublishService {
    pub fn new(pool: Pool, gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            posts: PostRepository::new(pool.clone()),
            channels: ChannelRepository::new(pool.clone()),
            pool,
            gateway,
        }
    }

    async fn resolve_target(&self, post: &Post, chat_id: Option<i64>) -> ServiceResult<Channel> {
        if let Some(chat_id) = chat_id.or(post.target_chat_id) {
            return self
                .channels
                .get_by_chat_id(chat_id)
                .await?
                .ok_or_else(|| RepoError::not_found("channel", chat_id).into());
        }
        self.channels
            .get_default()
            .await?
            .ok_or(ServiceError::NoTarget)
    }

    /// Send the post to `chat_id`, else its stored target, else the default
    /// channel, and record the delivery.
    #[instrument(skip_all, fields(post_id = post_id))]
    pub async fn publish(&self, post_id: i64, chat_id: Option<i64>) -> ServiceResult<Post> {
        let post = self.posts.fetch(post_id).await?;
        if post.is_archived {
            warn!(post_id, "refusing to publish archived post");
            return Err(ServiceError::Archived(post_id));
        }
        let channel = self.resolve_target(&post, chat_id).await?;
        let text = render_post_text(&post);
        let message_id = self
            .gateway
            .send_post(channel.chat_id, &text, post.image.as_deref())
            .await
            .inspect_err(|err| warn!(?err, post_id, chat_id = channel.chat_id, "send failed"))?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(RepoError::from)?;
        let published = record_publication(
            &mut tx,
            post_id,
            message_id,
            channel.chat_id,
            Some(&channel.title),
            now,
        )
        .await?;
        touch_last_used(&mut tx, channel.chat_id, now).await?;
        tx.commit().await.map_err(RepoError::from)?;
        info!(post_id, chat_id = channel.chat_id, message_id, "post published");
        Ok(published)
    }
}

/// What a Telegram user may do in the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    None,
    ContentManager,
    Admin,
}

impl Access {
    pub fn can_manage_posts(self) -> bool {
        self >= Access::ContentManager
    }

    pub fn is_admin(self) -> bool {
        self == Access::Admin
    }
}

#[derive(Clone)]
pub struct AccessControl {
    admin_ids: Vec<i64>,
    roles: RoleRepository,
}

impl AccessControl {
    pub fn new(pool: Pool, admin_ids: Vec<i64>) -> Self {
        Self {
            admin_ids,
            roles: RoleRepository::new(pool),
        }
    }

    /// Configured admins need no stored role.
    pub async fn access(&self, user_id: i64) -> Result<Access, RepoError> {
        if self.admin_ids.contains(&user_id) {
            return Ok(Access::Admin);
        }
        let roles = self.roles.user_roles(user_id).await?;
        if roles.contains(&RoleType::Admin) {
            Ok(Access::Admin)
        } else if roles.contains(&RoleType::ContentManager) {
            Ok(Access::ContentManager)
        } else {
            Ok(Access::None)
        }
    }
}
