use crate::config::Config;
use crate::db::{ChannelRepository, Pool, PostRepository, RoleRepository, UserRepository};
use crate::model::{Post, RoleType};
use crate::service::{
    Access, AccessControl, ChannelCheck, ChannelService, CheckOutcome, PublishService,
};
use crate::telegram::ChatGateway;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use teloxide::prelude::*;
use thiserror::Error;
use tracing::{info, instrument, warn};

const HELP: &str = "\
/newpost Title | content | tags - create a draft
/posts - latest posts
/post <id> - show a post
/edit <id> Title | content | tags - replace a post
/publish <id> [chat_id] - publish a post
/archive <id>, /restore <id>, /archived
/tag <tag> - posts with a tag
/delete <id> - delete a post for good
/channels, /addchannel <chat_id>, /setdefault <id>, /inactive
/verify [chat_id] - re-check bot access to channels
/cleanup - remove invalid and idle channels
/grant <user_id> <role>, /revoke <user_id> <role>
/roles <user_id>, /history [user_id]";

const HISTORY_LIMIT: i64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    pub tags: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    NewPost(PostDraft),
    Posts,
    Post(i64),
    Edit(i64, PostDraft),
    Publish(i64, Option<i64>),
    Archive(i64),
    Restore(i64),
    Archived,
    Tag(String),
    Delete(i64),
    Channels,
    AddChannel(i64),
    SetDefault(i64),
    Inactive,
    Verify(Option<i64>),
    Cleanup,
    Grant(i64, RoleType),
    Revoke(i64, RoleType),
    Roles(i64),
    History(Option<i64>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: /{0}. Try /help.")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
}

fn parse_id(arg: Option<&str>, usage: &'static str) -> Result<i64, CommandError> {
    arg.and_then(|a| a.trim().parse().ok())
        .ok_or(CommandError::Usage(usage))
}

fn parse_draft(rest: &str, usage: &'static str) -> Result<PostDraft, CommandError> {
    let mut parts = rest.splitn(3, '|').map(str::trim);
    let title = parts.next().unwrap_or_default();
    let content = parts.next().unwrap_or_default();
    if title.is_empty() || content.is_empty() {
        return Err(CommandError::Usage(usage));
    }
    let tags = parts.next().filter(|t| !t.is_empty()).map(str::to_string);
    Ok(PostDraft {
        title: title.to_string(),
        content: content.to_string(),
        tags,
    })
}

fn parse_role_args(rest: &str, usage: &'static str) -> Result<(i64, RoleType), CommandError> {
    let mut args = rest.split_whitespace();
    let user_id = parse_id(args.next(), usage)?;
    let role = args
        .next()
        .and_then(RoleType::parse_role)
        .ok_or(CommandError::Usage(usage))?;
    Ok((user_id, role))
}

/// Parse a slash command. Plain text yields `Ok(None)`.
pub fn parse_command(text: &str) -> Result<Option<Command>, CommandError> {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix('/') else {
        return Ok(None);
    };
    let (head, rest) = match body.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (body, ""),
    };
    // Group chats address commands as /cmd@botname.
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let first = rest.split_whitespace().next();

    let cmd = match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "newpost" => Command::NewPost(parse_draft(rest, "/newpost Title | content | tags")?),
        "posts" => Command::Posts,
        "post" => Command::Post(parse_id(first, "/post <id>")?),
        "edit" => {
            let usage = "/edit <id> Title | content | tags";
            let (id, draft) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            Command::Edit(parse_id(Some(id), usage)?, parse_draft(draft, usage)?)
        }
        "publish" => {
            let usage = "/publish <id> [chat_id]";
            let mut args = rest.split_whitespace();
            let id = parse_id(args.next(), usage)?;
            let chat = match args.next() {
                Some(c) => Some(parse_id(Some(c), usage)?),
                None => None,
            };
            Command::Publish(id, chat)
        }
        "archive" => Command::Archive(parse_id(first, "/archive <id>")?),
        "restore" => Command::Restore(parse_id(first, "/restore <id>")?),
        "archived" => Command::Archived,
        "tag" => Command::Tag(
            first
                .map(str::to_string)
                .ok_or(CommandError::Usage("/tag <tag>"))?,
        ),
        "delete" => Command::Delete(parse_id(first, "/delete <id>")?),
        "channels" => Command::Channels,
        "addchannel" => Command::AddChannel(parse_id(first, "/addchannel <chat_id>")?),
        "setdefault" => Command::SetDefault(parse_id(first, "/setdefault <id>")?),
        "inactive" => Command::Inactive,
        "verify" => match first {
            Some(_) => Command::Verify(Some(parse_id(first, "/verify [chat_id]")?)),
            None => Command::Verify(None),
        },
        "cleanup" => Command::Cleanup,
        "grant" => {
            let (user_id, role) = parse_role_args(rest, "/grant <user_id> admin|content_manager")?;
            Command::Grant(user_id, role)
        }
        "revoke" => {
            let (user_id, role) =
                parse_role_args(rest, "/revoke <user_id> admin|content_manager")?;
            Command::Revoke(user_id, role)
        }
        "roles" => Command::Roles(parse_id(first, "/roles <user_id>")?),
        "history" => match first {
            Some(_) => Command::History(Some(parse_id(first, "/history [user_id]")?)),
            None => Command::History(None),
        },
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

impl Command {
    fn required_access(&self) -> Access {
        match self {
            Command::Start | Command::Help => Access::None,
            Command::NewPost(_)
            | Command::Posts
            | Command::Post(_)
            | Command::Edit(..)
            | Command::Publish(..)
            | Command::Archive(_)
            | Command::Restore(_)
            | Command::Archived
            | Command::Tag(_)
            | Command::Delete(_) => Access::ContentManager,
            _ => Access::Admin,
        }
    }
}

/// The Telegram user issuing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub display_name: String,
}

/// Everything a command needs, shared across updates.
#[derive(Clone)]
pub struct BotContext {
    users: UserRepository,
    posts: PostRepository,
    channels: ChannelRepository,
    roles: RoleRepository,
    access: AccessControl,
    channel_service: ChannelService,
    publisher: PublishService,
    latest_limit: i64,
    archived_limit: i64,
    inactive_days: i64,
}

impl BotContext {
    pub fn new(pool: Pool, cfg: &Config, gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            posts: PostRepository::new(pool.clone()),
            channels: ChannelRepository::new(pool.clone()),
            roles: RoleRepository::new(pool.clone()),
            access: AccessControl::new(pool.clone(), cfg.telegram.admin_ids.clone()),
            channel_service: ChannelService::new(pool.clone(), gateway.clone()),
            publisher: PublishService::new(pool, gateway),
            latest_limit: cfg.app.latest_posts_limit as i64,
            archived_limit: cfg.app.archived_posts_limit as i64,
            inactive_days: cfg.app.inactive_channel_days as i64,
        }
    }
}

fn post_line(post: &Post) -> String {
    let state = if post.is_archived {
        "archived"
    } else {
        post.status.as_str()
    };
    format!("#{} [{}] {}", post.id, state, post.title)
}

fn post_details(post: &Post) -> String {
    let mut out = format!("{}\n\n{}", post_line(post), post.content);
    if let Some(tag) = &post.tag {
        out.push_str(&format!("\n\nTags: {tag}"));
    }
    if let Some(chat) = post.target_chat_id {
        let title = post.target_chat_title.as_deref().unwrap_or("?");
        out.push_str(&format!("\nTarget: {title} ({chat})"));
    }
    if let Some(message_id) = post.message_id {
        out.push_str(&format!("\nMessage id: {message_id}"));
    }
    out
}

fn check_line(check: &ChannelCheck) -> String {
    let c = &check.channel;
    match &check.outcome {
        CheckOutcome::Verified => format!("#{} {}: ok", c.id, c.title),
        CheckOutcome::Updated => format!("#{} {}: ok, info updated", c.id, c.title),
        CheckOutcome::Failed(reason) => format!("#{} {}: failed ({reason})", c.id, c.title),
    }
}

fn list_or<T>(items: &[T], empty: &str, line: impl Fn(&T) -> String) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items.iter().map(line).collect::<Vec<_>>().join("\n")
}

/// Run one command for `actor` and return the reply text.
#[instrument(skip_all, fields(user_id = actor.user_id))]
pub async fn execute(ctx: &BotContext, actor: &Actor, cmd: Command) -> Result<String> {
    let access = ctx.access.access(actor.user_id).await?;
    if access < cmd.required_access() {
        warn!(user_id = actor.user_id, ?cmd, "access denied");
        return Ok("You are not allowed to do that.".to_string());
    }

    let reply = match cmd {
        Command::Start => format!(
            "Hello, {}! Use /help to see the commands.",
            actor.display_name
        ),
        Command::Help => HELP.to_string(),
        Command::NewPost(draft) => {
            let post = ctx
                .posts
                .create_post(
                    &draft.title,
                    &draft.content,
                    None,
                    draft.tags.as_deref(),
                    actor.user_id,
                    Some(&actor.display_name),
                    None,
                )
                .await?;
            format!("Draft created: {}", post_line(&post))
        }
        Command::Posts => {
            let posts = ctx.posts.latest(ctx.latest_limit).await?;
            list_or(&posts, "No posts yet.", post_line)
        }
        Command::Post(id) => post_details(&ctx.posts.fetch(id).await?),
        Command::Edit(id, draft) => {
            let current = ctx.posts.fetch(id).await?;
            let post = ctx
                .posts
                .update_post(
                    id,
                    &draft.title,
                    &draft.content,
                    current.image.as_deref(),
                    draft.tags.as_deref(),
                    &actor.display_name,
                    Utc::now(),
                )
                .await?;
            format!("Updated: {}", post_line(&post))
        }
        Command::Publish(id, chat_id) => {
            let post = ctx.publisher.publish(id, chat_id).await?;
            format!(
                "Published {} to {}",
                post_line(&post),
                post.target_chat_title.as_deref().unwrap_or("channel")
            )
        }
        Command::Archive(id) => {
            let post = ctx.posts.archive(id, actor.user_id).await?;
            format!("Archived: {}", post_line(&post))
        }
        Command::Restore(id) => {
            let post = ctx.posts.restore(id).await?;
            format!("Restored: {}", post_line(&post))
        }
        Command::Archived => {
            let posts = ctx.posts.archived(ctx.archived_limit).await?;
            list_or(&posts, "No archived posts.", post_line)
        }
        Command::Tag(tag) => {
            let posts = ctx.posts.by_tag(&tag).await?;
            list_or(&posts, "No posts with that tag.", post_line)
        }
        Command::Delete(id) => {
            ctx.posts.delete(id).await?;
            format!("Post #{id} deleted.")
        }
        Command::Channels => {
            let channels = ctx.channels.list_all().await?;
            list_or(&channels, "No channels registered.", |c| {
                let mark = if c.is_default { " (default)" } else { "" };
                format!("#{} {} [{}]{}", c.id, c.title, c.chat_id, mark)
            })
        }
        Command::AddChannel(chat_id) => {
            let make_default = ctx.channels.get_default().await?.is_none();
            let channel = ctx
                .channel_service
                .register(chat_id, actor.user_id, make_default)
                .await?;
            format!("Channel added: #{} {}", channel.id, channel.title)
        }
        Command::SetDefault(id) => {
            let channel = ctx.channels.set_default(id).await?;
            format!("Default channel: {}", channel.title)
        }
        Command::Inactive => {
            let cutoff = Utc::now() - Duration::days(ctx.inactive_days);
            let channels = ctx.channels.get_inactive(cutoff).await?;
            list_or(&channels, "Every channel was used recently.", |c| {
                let last = c
                    .last_used_at
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "never".to_string());
                format!("#{} {} (last used {last})", c.id, c.title)
            })
        }
        Command::Verify(Some(chat_id)) => {
            let check = ctx.channel_service.verify(chat_id).await?;
            check_line(&check)
        }
        Command::Verify(None) => {
            let checks = ctx.channel_service.verify_all().await?;
            list_or(&checks, "No channels registered.", check_line)
        }
        Command::Cleanup => {
            let pruned = ctx.channel_service.cleanup(ctx.inactive_days).await?;
            let removed: Vec<_> = pruned
                .invalid
                .iter()
                .map(|c| (c, "invalid"))
                .chain(pruned.inactive.iter().map(|c| (c, "inactive")))
                .collect();
            list_or(&removed, "Nothing to clean up.", |(c, why)| {
                format!("Removed #{} {} ({why})", c.id, c.title)
            })
        }
        Command::Grant(user_id, role) => {
            ctx.users
                .get_by_user_id(user_id)
                .await?
                .context("user has not talked to the bot yet")?;
            ctx.roles.add_role(user_id, role, actor.user_id).await?;
            format!("Granted {} to {user_id}.", role.as_str())
        }
        Command::Revoke(user_id, role) => {
            ctx.roles.remove_role(user_id, role, actor.user_id).await?;
            format!("Revoked {} from {user_id}.", role.as_str())
        }
        Command::Roles(user_id) => {
            let roles = ctx.roles.role_details(user_id).await?;
            list_or(&roles, "No roles.", |r| {
                format!(
                    "{} since {}",
                    r.role_type.as_str(),
                    r.created_at.format("%Y-%m-%d")
                )
            })
        }
        Command::History(user_id) => {
            let entries = ctx.roles.role_history(user_id, HISTORY_LIMIT).await?;
            list_or(&entries, "No role changes.", |e| {
                let target = e
                    .user_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "deleted user".to_string());
                format!(
                    "{} {} {} {} by {}",
                    e.performed_at.format("%Y-%m-%d %H:%M"),
                    e.action.as_str(),
                    e.role_type.as_str(),
                    target,
                    e.performed_by
                )
            })
        }
    };
    Ok(reply)
}

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, ctx: &BotContext, msg: &Message) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u,
        None => return Ok(()),
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let tg_user_id = user.id.0 as i64;
    let full_name = user.full_name();
    ctx.users
        .upsert(tg_user_id, user.username.as_deref(), Some(&full_name))
        .await?;

    let cmd = match parse_command(text) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => return Ok(()),
        Err(err) => {
            let _ = bot.send_message(msg.chat.id, err.to_string()).await;
            return Ok(());
        }
    };

    let actor = Actor {
        user_id: tg_user_id,
        display_name: user
            .username
            .clone()
            .map(|u| format!("@{u}"))
            .unwrap_or(full_name),
    };
    let reply = match execute(ctx, &actor, cmd).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(?err, user_id = tg_user_id, "command failed");
            format!("Error: {err}")
        }
    };
    info!(user_id = tg_user_id, "replying");
    let _ = bot.send_message(msg.chat.id, reply).await;
    Ok(())
}
