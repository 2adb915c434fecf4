use async_trait::async_trait;
use field_store::{FieldKey, FieldRecord, FieldStore, StoreError};
use sea_query::{Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query, SelectStatement};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

pub struct PostgresFieldStore {
    pool: PgPool,
}

impl PostgresFieldStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(to_store_err)?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn fetch(&self, select: SelectStatement) -> Result<Vec<FieldRecord>, StoreError> {
        let (sql, values) = select.build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(to_store_err)?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl FieldStore for PostgresFieldStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self, key: &FieldKey) -> Result<Option<FieldRecord>, StoreError> {
        let mut select = base_select();
        select
            .and_where(Expr::col(FieldStates::SessionCode).eq(key.session_code.as_str()))
            .and_where(Expr::col(FieldStates::FieldId).eq(key.field_id.as_str()));
        Ok(self.fetch(select).await?.into_iter().next())
    }

    async fn compare_and_swap(
        &self,
        expected_revision: Option<u64>,
        next: &FieldRecord,
    ) -> Result<bool, StoreError> {
        let (sql, values) = match expected_revision {
            None => Query::insert()
                .into_table(FieldStates::Table)
                .columns([
                    FieldStates::SessionCode,
                    FieldStates::FieldId,
                    FieldStates::Value,
                    FieldStates::LockedBy,
                    FieldStates::LeaseAtMs,
                    FieldStates::UpdatedAtMs,
                    FieldStates::OwnerUserId,
                    FieldStates::Revision,
                ])
                .values_panic([
                    next.session_code.clone().into(),
                    next.field_id.clone().into(),
                    next.value.clone().into(),
                    next.locked_by.clone().into(),
                    next.lease_at_ms.map(to_db).into(),
                    to_db(next.updated_at_ms).into(),
                    next.owner_user_id.clone().into(),
                    to_db(next.revision).into(),
                ])
                .on_conflict(
                    OnConflict::columns([FieldStates::SessionCode, FieldStates::FieldId])
                        .do_nothing()
                        .to_owned(),
                )
                .build_sqlx(PostgresQueryBuilder),
            Some(expected) => Query::update()
                .table(FieldStates::Table)
                .values([
                    (FieldStates::Value, next.value.clone().into()),
                    (FieldStates::LockedBy, next.locked_by.clone().into()),
                    (FieldStates::LeaseAtMs, next.lease_at_ms.map(to_db).into()),
                    (FieldStates::UpdatedAtMs, to_db(next.updated_at_ms).into()),
                    (FieldStates::OwnerUserId, next.owner_user_id.clone().into()),
                    (FieldStates::Revision, to_db(next.revision).into()),
                ])
                .and_where(Expr::col(FieldStates::SessionCode).eq(next.session_code.as_str()))
                .and_where(Expr::col(FieldStates::FieldId).eq(next.field_id.as_str()))
                .and_where(Expr::col(FieldStates::Revision).eq(to_db(expected)))
                .build_sqlx(PostgresQueryBuilder),
        };
        let result = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(to_store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn session_rows(&self, session_code: &str) -> Result<Vec<FieldRecord>, StoreError> {
        let mut select = base_select();
        select
            .and_where(Expr::col(FieldStates::SessionCode).eq(session_code))
            .order_by(FieldStates::FieldId, Order::Asc);
        self.fetch(select).await
    }

    async fn changed_since(
        &self,
        session_code: &str,
        since_ms: u64,
    ) -> Result<Vec<FieldRecord>, StoreError> {
        let mut select = base_select();
        select
            .and_where(Expr::col(FieldStates::SessionCode).eq(session_code))
            .and_where(Expr::col(FieldStates::UpdatedAtMs).gte(to_db(since_ms)))
            .order_by(FieldStates::UpdatedAtMs, Order::Asc)
            .order_by(FieldStates::FieldId, Order::Asc);
        self.fetch(select).await
    }

    async fn leased_rows(&self, session_code: &str) -> Result<Vec<FieldRecord>, StoreError> {
        let mut select = base_select();
        select
            .and_where(Expr::col(FieldStates::SessionCode).eq(session_code))
            .and_where(Expr::col(FieldStates::LockedBy).is_not_null());
        self.fetch(select).await
    }
}

#[derive(Iden)]
enum FieldStates {
    Table,
    SessionCode,
    FieldId,
    Value,
    LockedBy,
    LeaseAtMs,
    UpdatedAtMs,
    OwnerUserId,
    Revision,
}

fn base_select() -> SelectStatement {
    Query::select()
        .columns([
            FieldStates::SessionCode,
            FieldStates::FieldId,
            FieldStates::Value,
            FieldStates::LockedBy,
            FieldStates::LeaseAtMs,
            FieldStates::UpdatedAtMs,
            FieldStates::OwnerUserId,
            FieldStates::Revision,
        ])
        .from(FieldStates::Table)
        .to_owned()
}

fn record_from_row(row: &PgRow) -> Result<FieldRecord, StoreError> {
    let session_code: String = row.try_get("session_code").map_err(to_store_err)?;
    let field_id: String = row.try_get("field_id").map_err(to_store_err)?;
    let locked_by: Option<String> = row.try_get("locked_by").map_err(to_store_err)?;
    let lease_at_ms: Option<i64> = row.try_get("lease_at_ms").map_err(to_store_err)?;
    let updated_at_ms: i64 = row.try_get("updated_at_ms").map_err(to_store_err)?;
    let revision: i64 = row.try_get("revision").map_err(to_store_err)?;
    Ok(FieldRecord {
        value: row.try_get("value").map_err(to_store_err)?,
        owner_user_id: row.try_get("owner_user_id").map_err(to_store_err)?,
        lease_at_ms: lease_at_ms.map(from_db),
        updated_at_ms: from_db(updated_at_ms),
        revision: from_db(revision),
        locked_by,
        session_code,
        field_id,
    })
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_store_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!().run(pool).await.map_err(to_store_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use field_store::update_row;

    #[test]
    fn insert_is_conditional_on_absence() {
        let (sql, _) = Query::insert()
            .into_table(FieldStates::Table)
            .columns([FieldStates::SessionCode, FieldStates::FieldId])
            .values_panic(["s".into(), "f".into()])
            .on_conflict(
                OnConflict::columns([FieldStates::SessionCode, FieldStates::FieldId])
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        assert!(sql.contains("ON CONFLICT (\"session_code\", \"field_id\") DO NOTHING"));
    }

    #[test]
    fn negative_columns_clamp_to_zero() {
        assert_eq!(from_db(-5), 0);
        assert_eq!(to_db(u64::MAX), i64::MAX);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_cas_round_trip() {
        let url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("PG_URL"))
            .expect("set DATABASE_URL");
        let store = PostgresFieldStore::connect(&url).await.expect("connect");
        let session = format!("pg-test-{}", std::process::id());
        let key = FieldKey::new(session.clone(), "activityName");

        let created = update_row(&store, &key, |_| {
            Some(FieldRecord::new(&key, "a", 100).with_lease("a", 100))
        })
        .await
        .unwrap();
        assert!(created.applied);
        assert!(!store
            .compare_and_swap(None, created.current.as_ref().unwrap())
            .await
            .unwrap());
        assert_eq!(store.leased_rows(&session).await.unwrap().len(), 1);

        let written = update_row(&store, &key, |row| {
            let mut next = row.cloned()?;
            next.value = "hello".into();
            Some(next.touched(300))
        })
        .await
        .unwrap();
        assert_eq!(written.current.unwrap().revision, 2);
        let changed = store.changed_since(&session, 300).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].value, "hello");
    }
}
