//! Generic repository over any [`Table`].
//!
//! Entity-specific operations live in `impl SqlRepository<Post>` (and friends)
//! next to the table definition; everything here is shared.

use super::error::{RepoError, RepoResult};
use super::query::{
    push_value, push_where, Column, Filter, Insert, OrderBy, Page, Patch, Table, Value,
};
use super::Pool;
use sqlx::QueryBuilder;
use std::marker::PhantomData;
use tracing::{info, instrument, warn};

pub struct SqlRepository<T> {
    pool: Pool,
    _table: PhantomData<fn() -> T>,
}

impl<T> Clone for SqlRepository<T> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

impl<T> SqlRepository<T> {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            _table: PhantomData,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl<T: Table> SqlRepository<T> {
    fn select() -> QueryBuilder<'static, sqlx::Sqlite> {
        QueryBuilder::new(format!("SELECT {} FROM {}", T::COLUMNS, T::NAME))
    }

    #[instrument(skip_all, fields(table = T::NAME))]
    pub async fn create(&self, data: &T::New) -> RepoResult<T> {
        data.validate()?;
        let mut tx = self.pool.begin().await?;
        let row = insert_returning::<T>(&mut tx, data).await?;
        tx.commit().await?;
        info!(id = row.id(), "created {}", T::ENTITY);
        Ok(row)
    }

    pub async fn get_by_id(&self, id: i64) -> RepoResult<Option<T>> {
        let mut qb = Self::select();
        qb.push(" WHERE id = ").push_bind(id);
        Ok(qb.build_query_as::<T>().fetch_optional(&self.pool).await?)
    }

    /// Like [`get_by_id`](Self::get_by_id) but a missing row is an error.
    pub async fn fetch(&self, id: i64) -> RepoResult<T> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| RepoError::not_found(T::ENTITY, id))
    }

    pub async fn get_all(&self, page: Page) -> RepoResult<Vec<T>> {
        self.filter_by(&[], page, Some(OrderBy::asc(id_column::<T>()?)))
            .await
    }

    #[instrument(skip_all, fields(table = T::NAME, id = id))]
    pub async fn update(&self, id: i64, patch: &T::Patch) -> RepoResult<T> {
        let assignments = patch.assignments();
        if assignments.is_empty() {
            return self.fetch(id).await;
        }

        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", T::NAME));
        for (i, (column, value)) in assignments.into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(column.name()).push(" = ");
            push_value(&mut qb, value);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {}", T::COLUMNS));

        let row = qb
            .build_query_as::<T>()
            .fetch_optional(&self.pool)
            .await
            .map_err(RepoError::from)
            .inspect_err(|err| warn!(?err, id, "update failed"))?;
        match row {
            Some(row) => {
                info!(id, "updated {}", T::ENTITY);
                Ok(row)
            }
            None => {
                warn!(id, "update target missing");
                Err(RepoError::not_found(T::ENTITY, id))
            }
        }
    }

    #[instrument(skip_all, fields(table = T::NAME, id = id))]
    pub async fn delete(&self, id: i64) -> RepoResult<()> {
        let done = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", T::NAME))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(RepoError::from)
            .inspect_err(|err| warn!(?err, id, "delete failed"))?;
        if done.rows_affected() == 0 {
            warn!(id, "delete target missing");
            return Err(RepoError::not_found(T::ENTITY, id));
        }
        info!(id, "deleted {}", T::ENTITY);
        Ok(())
    }

    pub async fn count(&self, filters: &[Filter<T::Column>]) -> RepoResult<i64> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", T::NAME));
        push_where(&mut qb, filters);
        Ok(qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn filter_by(
        &self,
        filters: &[Filter<T::Column>],
        page: Page,
        order: Option<OrderBy<T::Column>>,
    ) -> RepoResult<Vec<T>> {
        let mut qb = Self::select();
        push_where(&mut qb, filters);
        if let Some(order) = order {
            qb.push(" ORDER BY ")
                .push(order.column.name())
                .push(if order.descending { " DESC" } else { " ASC" });
        }
        qb.push(" LIMIT ").push_bind(page.limit);
        qb.push(" OFFSET ").push_bind(page.skip);
        Ok(qb.build_query_as::<T>().fetch_all(&self.pool).await?)
    }

    pub async fn exists(&self, filters: &[Filter<T::Column>]) -> RepoResult<bool> {
        let mut qb = QueryBuilder::new(format!("SELECT EXISTS (SELECT 1 FROM {}", T::NAME));
        push_where(&mut qb, filters);
        qb.push(")");
        Ok(qb
            .build_query_scalar::<bool>()
            .fetch_one(&self.pool)
            .await?)
    }

    /// Return the first row matching `filters`, or insert `defaults` with the
    /// filter values copied in. The flag is `true` when a row was inserted.
    ///
    /// The lookup compares against the values as they would be stored, so a
    /// filter that the payload normalizes (trimmed titles, tag lists) still
    /// finds the row it created earlier.
    #[instrument(skip_all, fields(table = T::NAME))]
    pub async fn get_or_create(
        &self,
        filters: &[Filter<T::Column>],
        defaults: &T::New,
    ) -> RepoResult<(T, bool)> {
        let mut data = defaults.clone();
        for filter in filters {
            data.apply(filter.column, &filter.value)?;
        }
        data.validate()?;
        let lookup = stored_filters(filters, &data.values());

        let mut tx = self.pool.begin().await?;
        let mut qb = Self::select();
        push_where(&mut qb, &lookup);
        qb.push(" ORDER BY id LIMIT 1");
        if let Some(found) = qb.build_query_as::<T>().fetch_optional(&mut *tx).await? {
            return Ok((found, false));
        }
        let row = insert_returning::<T>(&mut tx, &data).await?;
        tx.commit().await?;
        info!(id = row.id(), "created {} on lookup miss", T::ENTITY);
        Ok((row, true))
    }
}

fn id_column<T: Table>() -> RepoResult<T::Column> {
    T::column("id")
}

/// Swap each filter value for the one the payload would write to that column.
fn stored_filters<C: Column>(filters: &[Filter<C>], stored: &[(C, Value)]) -> Vec<Filter<C>> {
    filters
        .iter()
        .map(|filter| {
            let value = stored
                .iter()
                .find(|(column, _)| *column == filter.column)
                .map_or_else(|| filter.value.clone(), |(_, value)| value.clone());
            Filter {
                column: filter.column,
                value,
            }
        })
        .collect()
}

async fn insert_returning<T: Table>(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    data: &T::New,
) -> RepoResult<T> {
    if let Some(sql) = data.before_insert() {
        sqlx::query(sql)
            .execute(&mut **tx)
            .await
            .map_err(RepoError::from)
            .inspect_err(|err| warn!(?err, "pre-insert step on {} failed", T::NAME))?;
    }
    let values = data.values();
    let mut qb = QueryBuilder::new(format!("INSERT INTO {} (", T::NAME));
    let mut columns = qb.separated(", ");
    for (column, _) in &values {
        columns.push(column.name());
    }
    qb.push(") VALUES (");
    for (i, (_, value)) in values.into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, value);
    }
    qb.push(format!(") RETURNING {}", T::COLUMNS));
    qb.build_query_as::<T>()
        .fetch_one(&mut **tx)
        .await
        .map_err(RepoError::from)
        .inspect_err(|err| warn!(?err, "insert into {} failed", T::NAME))
}
