//! Outbound Telegram calls used by the services: inspecting a chat before it
//! is registered and delivering a post.

use crate::model::{ChatType, Post};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatMemberKind, InputFile};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Telegram's caption limit, applied to every rendered post.
pub const MAX_POST_TEXT: usize = 1024;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
    #[error("chat {0} is unavailable: {1}")]
    Unavailable(i64, String),
}

/// What the bot sees of a chat, and whether it may post there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatAccess {
    pub chat_id: i64,
    pub title: String,
    pub username: Option<String>,
    pub chat_type: ChatType,
    pub can_post: bool,
}

#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn inspect_chat(&self, chat_id: i64) -> Result<ChatAccess, GatewayError>;

    /// Deliver `text` (as a caption when `image` is set) and return the
    /// Telegram message id.
    async fn send_post(
        &self,
        chat_id: i64,
        text: &str,
        image: Option<&str>,
    ) -> Result<i64, GatewayError>;
}

/// Post body followed by its tags as hashtags, cut to [`MAX_POST_TEXT`]
/// characters with a trailing `...`.
pub fn render_post_text(post: &Post) -> String {
    let mut text = post.content.clone();
    let tags = post.tags();
    if !tags.is_empty() {
        text.push_str("\n\n");
        let hashtags: Vec<String> = tags.iter().map(|t| format!("#{t}")).collect();
        text.push_str(&hashtags.join(" "));
    }
    if text.chars().count() > MAX_POST_TEXT {
        let mut cut: String = text.chars().take(MAX_POST_TEXT - 3).collect();
        cut.push_str("...");
        return cut;
    }
    text
}

#[derive(Clone)]
pub struct TeloxideGateway {
    bot: Bot,
}

impl TeloxideGateway {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn chat_type_of(chat: &teloxide::types::Chat) -> ChatType {
    if chat.is_channel() {
        ChatType::Channel
    } else if chat.is_supergroup() {
        ChatType::Supergroup
    } else if chat.is_group() {
        ChatType::Group
    } else {
        ChatType::Private
    }
}

#[async_trait]
impl ChatGateway for TeloxideGateway {
    #[instrument(skip_all, fields(chat_id = chat_id))]
    async fn inspect_chat(&self, chat_id: i64) -> Result<ChatAccess, GatewayError> {
        let chat = self
            .bot
            .get_chat(ChatId(chat_id))
            .await
            .map_err(|err| GatewayError::Unavailable(chat_id, err.to_string()))?;
        let chat_type = chat_type_of(&chat);
        let me = self.bot.get_me().await?;
        let member = self.bot.get_chat_member(ChatId(chat_id), me.id).await?;
        let can_post = match &member.kind {
            ChatMemberKind::Owner(_) => true,
            ChatMemberKind::Administrator(admin) => {
                chat_type != ChatType::Channel || admin.can_post_messages
            }
            _ => false,
        };
        let title = chat
            .title()
            .or(chat.first_name())
            .map(str::to_string)
            .unwrap_or_else(|| chat_id.to_string());
        info!(chat_id, can_post, "inspected chat");
        Ok(ChatAccess {
            chat_id,
            title,
            username: chat.username().map(str::to_string),
            chat_type,
            can_post,
        })
    }

    #[instrument(skip_all, fields(chat_id = chat_id))]
    async fn send_post(
        &self,
        chat_id: i64,
        text: &str,
        image: Option<&str>,
    ) -> Result<i64, GatewayError> {
        if let Some(file_id) = image {
            match self
                .bot
                .send_photo(ChatId(chat_id), InputFile::file_id(file_id))
                .caption(text)
                .await
            {
                Ok(sent) => return Ok(sent.id.0 as i64),
                Err(err) => warn!(?err, chat_id, "photo send failed; sending text"),
            }
        }
        let sent = self.bot.send_message(ChatId(chat_id), text).await?;
        Ok(sent.id.0 as i64)
    }
}
