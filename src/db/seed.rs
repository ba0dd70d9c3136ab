use super::error::RepoResult;
use super::roles::RoleRepository;
use super::users::UserRepository;
use super::Pool;
use crate::model::{RoleType, User};
use tracing::{info, instrument};

/// Make `user_id` an administrator. Safe to run repeatedly: the grant (and
/// its audit row) is only written when the role is missing. Returns the user
/// and whether a grant happened.
#[instrument(skip_all, fields(user_id = user_id))]
pub async fn ensure_admin(
    pool: &Pool,
    user_id: i64,
    username: Option<&str>,
) -> RepoResult<(User, bool)> {
    let user = UserRepository::new(pool.clone())
        .upsert(user_id, username, None)
        .await?;
    let roles = RoleRepository::new(pool.clone());
    if roles.check_role(user_id, RoleType::Admin).await? {
        info!(user_id, "admin role already present");
        return Ok((user, false));
    }
    roles.add_role(user_id, RoleType::Admin, user_id).await?;
    info!(user_id, "admin seeded");
    Ok((user, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    #[tokio::test]
    async fn seeding_twice_writes_one_audit_row() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let (_, granted) = ensure_admin(&pool, 500, Some("boss")).await.unwrap();
        assert!(granted);
        let (user, granted) = ensure_admin(&pool, 500, None).await.unwrap();
        assert!(!granted);
        assert_eq!(user.username.as_deref(), Some("boss"));

        let roles = RoleRepository::new(pool.clone());
        assert!(roles.check_role(500, RoleType::Admin).await.unwrap());
        let history = roles.role_history(Some(500), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].performed_by, 500);
    }
}
