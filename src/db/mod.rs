//! Database module: pool setup, migrations and the repositories.
//!
//! - `query`: typed columns, values, filters and the per-table traits.
//! - `repo`: the generic [`SqlRepository`] every table shares.
//! - `users`, `roles`, `channels`, `posts`: table definitions and their
//!   entity-specific operations.
//! - `seed`: the idempotent admin bootstrap.

pub mod channels;
pub mod error;
pub mod posts;
pub mod query;
pub mod repo;
pub mod roles;
pub mod seed;
pub mod users;

use anyhow::Result;
use sqlx::SqlitePool;

pub use channels::{ChannelColumn, ChannelRepository, PrunedChannels};
pub use error::{RepoError, RepoResult};
pub use posts::{PostColumn, PostRepository};
pub use query::{Column, Filter, OrderBy, Page, Table, Value};
pub use repo::SqlRepository;
pub use roles::RoleRepository;
pub use users::{UserColumn, UserRepository};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and create its parent
/// directory. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Table row counts, for the admin `check` command.
pub async fn table_counts(pool: &Pool) -> Result<Vec<(&'static str, i64)>> {
    let mut counts = Vec::new();
    for table in ["users", "user_roles", "role_audit", "channels", "posts"] {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?;
        counts.push((table, n));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn file_url_creates_parent_dir() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("postbot.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, url);
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let counts = table_counts(&pool).await.unwrap();
        assert_eq!(counts.len(), 5);
        assert!(counts.iter().all(|(_, n)| *n == 0));
    }
}
