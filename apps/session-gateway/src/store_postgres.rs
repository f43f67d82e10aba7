use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_sdk::{SessionRecord, SessionState, SessionStore, StoreError};
use sea_query::{Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;

pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(backend)?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn upsert(&self, record: SessionRecord) -> Result<(), StoreError> {
        let (sql, values) = Query::insert()
            .into_table(Sessions::Table)
            .columns([
                Sessions::SessionId,
                Sessions::State,
                Sessions::PairingPayload,
                Sessions::LastUpdated,
            ])
            .values_panic([
                record.session_id.clone().into(),
                record.state.as_str().into(),
                record.pairing_payload.clone().into(),
                record.last_updated.into(),
            ])
            .on_conflict(
                OnConflict::column(Sessions::SessionId)
                    .update_columns([
                        Sessions::State,
                        Sessions::PairingPayload,
                        Sessions::LastUpdated,
                    ])
                    .action_and_where(
                        Expr::col((Sessions::Table, Sessions::LastUpdated))
                            .lte(Expr::cust("excluded.last_updated")),
                    )
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_state(
        &self,
        session_id: &str,
        state: SessionState,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (sql, values) = Query::update()
            .table(Sessions::Table)
            .values([
                (Sessions::State, state.as_str().into()),
                (Sessions::PairingPayload, Option::<String>::None.into()),
                (Sessions::LastUpdated, at.into()),
            ])
            .and_where(Expr::col(Sessions::SessionId).eq(session_id))
            .and_where(Expr::col(Sessions::LastUpdated).lte(at))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let (sql, values) = Query::select()
            .columns([
                Sessions::SessionId,
                Sessions::State,
                Sessions::PairingPayload,
                Sessions::LastUpdated,
            ])
            .from(Sessions::Table)
            .and_where(Expr::col(Sessions::SessionId).eq(session_id))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.as_ref().and_then(to_record))
    }

    async fn find_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let (sql, values) = Query::select()
            .columns([
                Sessions::SessionId,
                Sessions::State,
                Sessions::PairingPayload,
                Sessions::LastUpdated,
            ])
            .from(Sessions::Table)
            .order_by(Sessions::SessionId, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().filter_map(to_record).collect())
    }
}

fn to_record(row: &PgRow) -> Option<SessionRecord> {
    let session_id: String = row.try_get("session_id").ok()?;
    let state: String = row.try_get("state").ok()?;
    let pairing_payload: Option<String> = row.try_get("pairing_payload").ok()?;
    let last_updated: DateTime<Utc> = row.try_get("last_updated").ok()?;
    match state.parse::<SessionState>() {
        Ok(state) => Some(SessionRecord::new(
            session_id,
            state,
            pairing_payload,
            last_updated,
        )),
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "skipping session row");
            None
        }
    }
}

#[derive(Iden)]
enum Sessions {
    Table,
    SessionId,
    State,
    PairingPayload,
    LastUpdated,
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!().run(pool).await.map_err(backend)
}
