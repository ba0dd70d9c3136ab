//! Role grants and their append-only audit trail.
//!
//! `user_roles` has a composite key, so it sits outside the generic
//! repository. Every grant or revoke writes its `role_audit` row in the same
//! transaction as the change itself.

use super::error::{RepoError, RepoResult};
use super::Pool;
use crate::model::{AuditAction, RoleAudit, RoleType, UserRole};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct RoleRepository {
    pool: Pool,
}

impl RoleRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Grant `role` to `user_id`. A repeated grant is a conflict.
    #[instrument(skip_all, fields(user_id = user_id, role = role.as_str()))]
    pub async fn add_role(
        &self,
        user_id: i64,
        role: RoleType,
        granted_by: i64,
    ) -> RepoResult<UserRole> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let granted = sqlx::query_as::<_, UserRole>(
            "INSERT INTO user_roles (user_id, role_type, created_at, created_by) \
             VALUES (?, ?, ?, ?) RETURNING user_id, role_type, created_at, created_by",
        )
        .bind(user_id)
        .bind(role)
        .bind(now)
        .bind(granted_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, user_id, "grant failed"))?;
        append_audit(&mut tx, user_id, role, AuditAction::Add, granted_by, now).await?;
        tx.commit().await?;
        info!(user_id, role = role.as_str(), granted_by, "role granted");
        Ok(granted)
    }

    /// Revoke `role` from `user_id`. Not found if the user did not hold it.
    #[instrument(skip_all, fields(user_id = user_id, role = role.as_str()))]
    pub async fn remove_role(
        &self,
        user_id: i64,
        role: RoleType,
        revoked_by: i64,
    ) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;
        let done = sqlx::query("DELETE FROM user_roles WHERE user_id = ? AND role_type = ?")
            .bind(user_id)
            .bind(role)
            .execute(&mut *tx)
            .await
            .map_err(RepoError::from)
            .inspect_err(|err| warn!(?err, user_id, "revoke failed"))?;
        if done.rows_affected() == 0 {
            warn!(user_id, role = role.as_str(), "revoke: role not held");
            return Err(RepoError::not_found(
                "role",
                format!("{} of user {user_id}", role.as_str()),
            ));
        }
        append_audit(&mut tx, user_id, role, AuditAction::Remove, revoked_by, Utc::now()).await?;
        tx.commit().await?;
        info!(user_id, role = role.as_str(), revoked_by, "role revoked");
        Ok(())
    }

    pub async fn check_role(&self, user_id: i64, role: RoleType) -> RepoResult<bool> {
        let held: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM user_roles WHERE user_id = ? AND role_type = ?)",
        )
        .bind(user_id)
        .bind(role)
        .fetch_one(&self.pool)
        .await?;
        Ok(held)
    }

    pub async fn user_roles(&self, user_id: i64) -> RepoResult<Vec<RoleType>> {
        let roles = self
            .role_details(user_id)
            .await?
            .into_iter()
            .map(|r| r.role_type)
            .collect();
        Ok(roles)
    }

    /// Grants of `user_id` with who granted them and when, oldest first.
    pub async fn role_details(&self, user_id: i64) -> RepoResult<Vec<UserRole>> {
        let rows = sqlx::query_as::<_, UserRole>(
            "SELECT user_id, role_type, created_at, created_by FROM user_roles \
             WHERE user_id = ? ORDER BY created_at, role_type",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Audit entries, newest first, optionally for one user.
    pub async fn role_history(
        &self,
        user_id: Option<i64>,
        limit: i64,
    ) -> RepoResult<Vec<RoleAudit>> {
        let rows = sqlx::query_as::<_, RoleAudit>(
            "SELECT id, user_id, role_type, action, performed_by, performed_at FROM role_audit \
             WHERE (?1 IS NULL OR user_id = ?1) \
             ORDER BY performed_at DESC, id DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn append_audit(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: i64,
    role: RoleType,
    action: AuditAction,
    performed_by: i64,
    at: DateTime<Utc>,
) -> RepoResult<()> {
    sqlx::query(
        "INSERT INTO role_audit (user_id, role_type, action, performed_by, performed_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(role)
    .bind(action)
    .bind(performed_by)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map_err(RepoError::from)
    .inspect_err(|err| warn!(?err, user_id, action = action.as_str(), "audit insert failed"))?;
    Ok(())
}
