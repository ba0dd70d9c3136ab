use std::collections::HashMap;
use std::sync::Arc;
use tg_postbot::config;
use tg_postbot::db::{ChannelRepository, PostRepository, RoleRepository, UserRepository};
use tg_postbot::handlers::{execute, parse_command, Actor, BotContext};
use tg_postbot::model::{ChatType, RoleType};
use tg_postbot::service::{ChannelService, CheckOutcome, PublishService, ServiceError};
use tg_postbot::telegram::{ChatAccess, ChatGateway, GatewayError};
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone, PartialEq)]
struct SendCall {
    chat_id: i64,
    text: String,
    image: Option<String>,
}

#[derive(Clone, Default)]
struct RecordingGateway {
    chats: Arc<Mutex<HashMap<i64, ChatAccess>>>,
    sends: Arc<Mutex<Vec<SendCall>>>,
    fail_sends: bool,
}

impl RecordingGateway {
    async fn with_chat(self, chat_id: i64, title: &str, can_post: bool) -> Self {
        self.chats.lock().await.insert(
            chat_id,
            ChatAccess {
                chat_id,
                title: title.to_string(),
                username: None,
                chat_type: ChatType::Channel,
                can_post,
            },
        );
        self
    }

    async fn forget_chat(&self, chat_id: i64) {
        self.chats.lock().await.remove(&chat_id);
    }

    async fn sends(&self) -> Vec<SendCall> {
        self.sends.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ChatGateway for RecordingGateway {
    async fn inspect_chat(&self, chat_id: i64) -> Result<ChatAccess, GatewayError> {
        self.chats
            .lock()
            .await
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| GatewayError::Unavailable(chat_id, "chat not found".into()))
    }

    async fn send_post(
        &self,
        chat_id: i64,
        text: &str,
        image: Option<&str>,
    ) -> Result<i64, GatewayError> {
        if self.fail_sends {
            return Err(GatewayError::Unavailable(chat_id, "forbidden".into()));
        }
        let mut sends = self.sends.lock().await;
        sends.push(SendCall {
            chat_id,
            text: text.to_string(),
            image: image.map(str::to_string),
        });
        Ok(1000 + sends.len() as i64)
    }
}

async fn seed_users(pool: &sqlx::SqlitePool) {
    let users = UserRepository::new(pool.clone());
    users.upsert(1, Some("admin"), None).await.unwrap();
    users.upsert(2, Some("writer"), None).await.unwrap();
    users.upsert(3, Some("guest"), None).await.unwrap();
}

#[tokio::test]
async fn register_checks_post_rights() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let gateway = RecordingGateway::default()
        .with_chat(-100, "News", true)
        .await
        .with_chat(-200, "Readonly", false)
        .await;
    let service = ChannelService::new(pool.clone(), Arc::new(gateway));

    let channel = service.register(-100, 1, true).await.unwrap();
    assert_eq!(channel.title, "News");
    assert!(channel.is_default);
    assert_eq!(channel.added_by, Some(1));

    let err = service.register(-200, 1, false).await.unwrap_err();
    assert!(matches!(err, ServiceError::CannotPost(-200)));
    let err = service.register(-300, 1, false).await.unwrap_err();
    assert!(matches!(err, ServiceError::Gateway(_)));

    let channels = ChannelRepository::new(pool).list_all().await.unwrap();
    assert_eq!(channels.len(), 1);
}

#[tokio::test]
async fn register_as_default_replaces_old_default() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let gateway = RecordingGateway::default()
        .with_chat(-100, "News", true)
        .await
        .with_chat(-200, "Sports", true)
        .await;
    let service = ChannelService::new(pool.clone(), Arc::new(gateway));

    let old = service.register(-100, 1, true).await.unwrap();
    let new = service.register(-200, 1, true).await.unwrap();
    assert!(new.is_default);

    let repo = ChannelRepository::new(pool);
    assert_eq!(repo.get_default().await.unwrap().unwrap().id, new.id);
    let old = repo.fetch(old.id).await.unwrap();
    assert!(!old.is_default);
}

#[tokio::test]
async fn verify_all_records_each_outcome() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let gateway = RecordingGateway::default()
        .with_chat(-100, "News", true)
        .await
        .with_chat(-200, "Sports", true)
        .await
        .with_chat(-300, "Tech", true)
        .await;
    let service = ChannelService::new(pool.clone(), Arc::new(gateway.clone()));
    for chat_id in [-100, -200, -300] {
        service.register(chat_id, 1, false).await.unwrap();
    }

    let gateway = gateway.with_chat(-200, "Sports Daily", true).await;
    gateway.forget_chat(-300).await;

    let checks = service.verify_all().await.unwrap();
    let outcomes: Vec<_> = checks
        .iter()
        .map(|c| (c.channel.chat_id, c.outcome.clone()))
        .collect();
    assert_eq!(outcomes[0], (-100, CheckOutcome::Verified));
    assert_eq!(outcomes[1], (-200, CheckOutcome::Updated));
    assert_eq!(outcomes[2].0, -300);
    assert!(outcomes[2].1.is_failed());
    assert_eq!(checks[1].channel.title, "Sports Daily");
    assert!(checks.iter().all(|c| c.channel.verified_at.is_some()));

    let repo = ChannelRepository::new(pool);
    let invalid = repo.get_invalid().await.unwrap();
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].chat_id, -300);
    assert!(invalid[0].error_message.is_some());

    let err = service.verify(-999).await.unwrap_err();
    assert!(matches!(err, ServiceError::Repo(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn cleanup_removes_unreachable_channels_but_keeps_default() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let gateway = RecordingGateway::default()
        .with_chat(-100, "News", true)
        .await
        .with_chat(-200, "Sports", true)
        .await;
    let service = ChannelService::new(pool.clone(), Arc::new(gateway.clone()));
    service.register(-100, 1, true).await.unwrap();
    service.register(-200, 1, false).await.unwrap();

    gateway.forget_chat(-100).await;
    gateway.forget_chat(-200).await;
    service.verify_all().await.unwrap();

    let pruned = service.cleanup(30).await.unwrap();
    assert_eq!(pruned.invalid.len(), 1);
    assert_eq!(pruned.invalid[0].chat_id, -200);
    assert!(pruned.inactive.is_empty());

    let left = ChannelRepository::new(pool).list_all().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].chat_id, -100);
    assert!(!left[0].is_valid);
}

#[tokio::test]
async fn publish_uses_default_channel_and_records_delivery() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let gateway = RecordingGateway::default()
        .with_chat(-100, "News", true)
        .await;
    let gw = Arc::new(gateway.clone());
    ChannelService::new(pool.clone(), gw.clone())
        .register(-100, 1, true)
        .await
        .unwrap();

    let posts = PostRepository::new(pool.clone());
    let post = posts
        .create_post("Hello", "Body", Some("file-id"), Some("news"), 2, None, None)
        .await
        .unwrap();

    let published = PublishService::new(pool.clone(), gw)
        .publish(post.id, None)
        .await
        .unwrap();
    assert!(published.is_published());
    assert_eq!(published.message_id, Some(1001));
    assert_eq!(published.target_chat_id, Some(-100));
    assert_eq!(published.target_chat_title.as_deref(), Some("News"));

    let sends = gateway.sends().await;
    assert_eq!(
        sends,
        vec![SendCall {
            chat_id: -100,
            text: "Body\n\n#news".into(),
            image: Some("file-id".into()),
        }]
    );

    let channel = ChannelRepository::new(pool)
        .get_by_chat_id(-100)
        .await
        .unwrap()
        .unwrap();
    assert!(channel.last_used_at.is_some());
}

#[tokio::test]
async fn publish_refuses_archived_and_unknown_targets() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let gateway = RecordingGateway::default();
    let publisher = PublishService::new(pool.clone(), Arc::new(gateway.clone()));
    let posts = PostRepository::new(pool.clone());
    let post = posts
        .create_post("t", "c", None, None, 2, None, None)
        .await
        .unwrap();

    let err = publisher.publish(post.id, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::NoTarget));

    let err = publisher.publish(post.id, Some(-555)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Repo(ref e) if e.is_not_found()));

    posts.archive(post.id, 1).await.unwrap();
    let err = publisher.publish(post.id, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Archived(_)));

    assert!(gateway.sends().await.is_empty());
    let stored = posts.fetch(post.id).await.unwrap();
    assert!(!stored.is_published());
}

#[tokio::test]
async fn failed_send_leaves_post_draft() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let ok = RecordingGateway::default().with_chat(-100, "News", true).await;
    ChannelService::new(pool.clone(), Arc::new(ok))
        .register(-100, 1, true)
        .await
        .unwrap();

    let failing = RecordingGateway {
        fail_sends: true,
        ..Default::default()
    };
    let posts = PostRepository::new(pool.clone());
    let post = posts
        .create_post("t", "c", None, None, 2, None, None)
        .await
        .unwrap();
    let err = PublishService::new(pool.clone(), Arc::new(failing))
        .publish(post.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Gateway(_)));

    let stored = posts.fetch(post.id).await.unwrap();
    assert!(!stored.is_published());
    let channel = ChannelRepository::new(pool)
        .get_by_chat_id(-100)
        .await
        .unwrap()
        .unwrap();
    assert!(channel.last_used_at.is_none());
}

#[tokio::test]
async fn commands_respect_roles() {
    let pool = setup_pool().await;
    seed_users(&pool).await;
    let mut cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.telegram.admin_ids = vec![1];
    let gateway = RecordingGateway::default()
        .with_chat(-100, "News", true)
        .await;
    let ctx = BotContext::new(pool.clone(), &cfg, Arc::new(gateway.clone()));

    let admin = Actor {
        user_id: 1,
        display_name: "@admin".into(),
    };
    let writer = Actor {
        user_id: 2,
        display_name: "@writer".into(),
    };
    let guest = Actor {
        user_id: 3,
        display_name: "@guest".into(),
    };
    let run = |text: &str| parse_command(text).unwrap().unwrap();

    let denied = execute(&ctx, &guest, run("/posts")).await.unwrap();
    assert_eq!(denied, "You are not allowed to do that.");

    let reply = execute(&ctx, &admin, run("/grant 2 content_manager"))
        .await
        .unwrap();
    assert!(reply.contains("Granted content_manager"));
    assert!(RoleRepository::new(pool.clone())
        .check_role(2, RoleType::ContentManager)
        .await
        .unwrap());

    let reply = execute(&ctx, &writer, run("/newpost Hi | body | news"))
        .await
        .unwrap();
    assert!(reply.starts_with("Draft created: #1"));

    let denied = execute(&ctx, &writer, run("/addchannel -100")).await.unwrap();
    assert_eq!(denied, "You are not allowed to do that.");

    let reply = execute(&ctx, &admin, run("/addchannel -100")).await.unwrap();
    assert!(reply.contains("News"));

    let reply = execute(&ctx, &writer, run("/publish 1")).await.unwrap();
    assert!(reply.starts_with("Published #1"));
    assert_eq!(gateway.sends().await.len(), 1);

    let reply = execute(&ctx, &writer, run("/tag news")).await.unwrap();
    assert!(reply.contains("#1 [published] Hi"));

    let reply = execute(&ctx, &admin, run("/history 2")).await.unwrap();
    assert!(reply.contains("add content_manager 2 by 1"));

    let denied = execute(&ctx, &writer, run("/verify")).await.unwrap();
    assert_eq!(denied, "You are not allowed to do that.");
    let reply = execute(&ctx, &admin, run("/verify")).await.unwrap();
    assert!(reply.contains("News: ok"));
    let reply = execute(&ctx, &admin, run("/cleanup")).await.unwrap();
    assert_eq!(reply, "Nothing to clean up.");

    let missing = execute(&ctx, &admin, run("/grant 99 admin")).await;
    assert!(missing.is_err());
}
