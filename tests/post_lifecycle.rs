use tg_postbot::db::channels::NewChannel;
use tg_postbot::db::posts::{NewPost, PostPatch};
use tg_postbot::db::{
    ChannelRepository, Filter, OrderBy, Page, PostColumn, PostRepository, RepoError, Table,
    UserRepository,
};
use tg_postbot::model::{ChatType, Post, PostStatus};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    UserRepository::new(pool.clone())
        .upsert(7, Some("author"), Some("Author"))
        .await
        .unwrap();
    pool
}

#[tokio::test]
async fn create_publish_archive_restore_delete() {
    let pool = setup_pool().await;
    ChannelRepository::new(pool.clone())
        .create(&NewChannel::new(-100, "Main", ChatType::Channel))
        .await
        .unwrap();
    let posts = PostRepository::new(pool);

    let post = posts.create(&NewPost::new("Title", "Body", 7)).await.unwrap();
    assert_eq!(post.status, PostStatus::Draft);
    assert!(post.published_at.is_none());

    posts.publish(post.id).await.unwrap();
    let marked = posts
        .mark_published(post.id, 31, -100, Some("Main"))
        .await
        .unwrap();
    assert_eq!(marked.message_id, Some(31));
    assert_eq!(marked.target_chat_id, Some(-100));
    assert_eq!(marked.status, PostStatus::Published);

    let archived = posts.archive(post.id, 9).await.unwrap();
    assert_eq!(archived.archived_by, Some(9));
    let restored = posts.restore(post.id).await.unwrap();
    assert_eq!(
        Post {
            is_archived: true,
            archived_at: archived.archived_at,
            archived_by: Some(9),
            ..restored.clone()
        },
        archived
    );

    posts.delete(post.id).await.unwrap();
    assert!(posts.get_by_id(post.id).await.unwrap().is_none());
}

#[tokio::test]
async fn draft_rows_reject_delivery_fields() {
    let pool = setup_pool().await;
    let posts = PostRepository::new(pool.clone());
    let post = posts.create(&NewPost::new("t", "c", 7)).await.unwrap();

    let res = sqlx::query("UPDATE posts SET message_id = 5 WHERE id = ?")
        .bind(post.id)
        .execute(&pool)
        .await;
    assert!(res.is_err());
    let res = sqlx::query("UPDATE posts SET is_archived = 1 WHERE id = ?")
        .bind(post.id)
        .execute(&pool)
        .await;
    assert!(res.is_err());
}

#[tokio::test]
async fn generic_contract_over_posts() {
    let posts = PostRepository::new(setup_pool().await);
    for i in 0..5 {
        let mut new = NewPost::new(format!("post {i}"), "body", 7);
        let tag = if i % 2 == 0 { "even" } else { "odd" };
        new.tag = Some(tag.to_string());
        posts.create(&new).await.unwrap();
    }

    assert_eq!(posts.count(&[]).await.unwrap(), 5);
    let even = [Filter::eq(PostColumn::Tag, "even")];
    assert_eq!(posts.count(&even).await.unwrap(), 3);
    assert!(posts.exists(&even).await.unwrap());
    assert!(!posts
        .exists(&[Filter::eq(PostColumn::Tag, "none")])
        .await
        .unwrap());

    let page = posts.get_all(Page::new(1, 2)).await.unwrap();
    assert_eq!(
        page.iter().map(|p| p.title.as_str()).collect::<Vec<_>>(),
        vec!["post 1", "post 2"]
    );

    let newest_even = posts
        .filter_by(&even, Page::new(0, 1), Some(OrderBy::desc(PostColumn::Id)))
        .await
        .unwrap();
    assert_eq!(newest_even[0].title, "post 4");

    let patched = posts
        .update(
            newest_even[0].id,
            &PostPatch {
                title: Some("renamed".into()),
                image: Some(Some("pic".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(patched.title, "renamed");
    assert_eq!(patched.image.as_deref(), Some("pic"));
    assert_eq!(patched.content, "body");

    let rename = PostPatch {
        title: Some("x".into()),
        ..Default::default()
    };
    let missing = posts.update(999, &rename).await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn unknown_field_names_are_rejected() {
    let posts = PostRepository::new(setup_pool().await);
    let err = Post::filter("titel", "x").unwrap_err();
    assert!(matches!(err, RepoError::UnknownField { ref field, .. } if field == "titel"));

    let by_name = Post::filter("title", "x").unwrap();
    assert_eq!(posts.count(&[by_name]).await.unwrap(), 0);
}

#[tokio::test]
async fn get_or_create_by_title() {
    let posts = PostRepository::new(setup_pool().await);
    let filters = [Filter::eq(PostColumn::Title, "pinned")];
    let defaults = NewPost::new("placeholder", "pinned body", 7);

    let (first, created) = posts.get_or_create(&filters, &defaults).await.unwrap();
    assert!(created);
    assert_eq!(first.title, "pinned");
    let (second, created) = posts.get_or_create(&filters, &defaults).await.unwrap();
    assert!(!created);
    assert_eq!(first.id, second.id);
    assert_eq!(posts.count(&[]).await.unwrap(), 1);
}

#[tokio::test]
async fn get_or_create_matches_normalized_values() {
    let posts = PostRepository::new(setup_pool().await);
    let defaults = NewPost::new("placeholder", "body", 7);

    let by_tags = [Filter::eq(PostColumn::Tag, "#News, sports")];
    let (first, created) = posts.get_or_create(&by_tags, &defaults).await.unwrap();
    assert!(created);
    assert_eq!(first.tag.as_deref(), Some("news sports"));
    let (again, created) = posts.get_or_create(&by_tags, &defaults).await.unwrap();
    assert!(!created);
    assert_eq!(again.id, first.id);

    let by_title = [Filter::eq(PostColumn::Title, "pinned ")];
    let (pinned, created) = posts.get_or_create(&by_title, &defaults).await.unwrap();
    assert!(created);
    assert_eq!(pinned.title, "pinned");
    let (again, created) = posts.get_or_create(&by_title, &defaults).await.unwrap();
    assert!(!created);
    assert_eq!(again.id, pinned.id);

    assert_eq!(posts.count(&[]).await.unwrap(), 2);
}

#[tokio::test]
async fn deleting_channel_clears_post_target() {
    let pool = setup_pool().await;
    let channels = ChannelRepository::new(pool.clone());
    let channel = channels
        .create(&NewChannel::new(-100, "Main", ChatType::Channel))
        .await
        .unwrap();
    let posts = PostRepository::new(pool);
    let post = posts.create(&NewPost::new("t", "c", 7)).await.unwrap();
    posts
        .update_target_chat(post.id, -100, Some("Main"))
        .await
        .unwrap();

    channels.delete(channel.id).await.unwrap();
    let post = posts.fetch(post.id).await.unwrap();
    assert_eq!(post.target_chat_id, None);
    assert_eq!(post.target_chat_title.as_deref(), Some("Main"));
    assert!(channels.get_by_chat_id(-100).await.unwrap().is_none());
}
