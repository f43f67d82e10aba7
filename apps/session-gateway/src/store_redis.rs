use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use gateway_sdk::{SessionRecord, SessionState, SessionStore, StoreError};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use tracing::warn;

const INDEX_KEY: &str = "session:ids";

/// Writes only if the stored timestamp is not newer than ours.
static UPSERT_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r"
local current = redis.call('HGET', KEYS[1], 'ts')
if current and tonumber(current) > tonumber(ARGV[2]) then
  return 0
end
redis.call('HSET', KEYS[1], 'record', ARGV[1], 'ts', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
",
    )
});

static UPDATE_STATE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r"
local current = redis.call('HGET', KEYS[1], 'ts')
if not current or tonumber(current) > tonumber(ARGV[2]) then
  return 0
end
local record = cjson.decode(redis.call('HGET', KEYS[1], 'record'))
record['state'] = ARGV[1]
record['pairing_payload'] = cjson.null
record['last_updated'] = ARGV[3]
redis.call('HSET', KEYS[1], 'record', cjson.encode(record), 'ts', ARGV[2])
return 1
",
    )
});

/// Redis-backed records: one hash per session (`record` JSON + `ts`
/// microseconds) plus an index set of known ids.
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        Ok(Self { conn })
    }
}

fn record_key(session_id: &str) -> String {
    format!("session:record:{session_id}")
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn upsert(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&record).map_err(backend)?;
        let _: i64 = UPSERT_SCRIPT
            .key(record_key(&record.session_id))
            .key(INDEX_KEY)
            .arg(payload)
            .arg(record.last_updated.timestamp_micros())
            .arg(&record.session_id)
            .invoke_async(&mut conn)
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
        let mut conn = self.conn.clone();
        let _: i64 = UPDATE_STATE_SCRIPT
            .key(record_key(session_id))
            .arg(state.as_str())
            .arg(at.timestamp_micros())
            .arg(at.to_rfc3339_opts(SecondsFormat::Micros, true))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("HGET")
            .arg(record_key(session_id))
            .arg("record")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        payload
            .map(|p| serde_json::from_str::<SessionRecord>(&p).map_err(backend))
            .transpose()
    }

    async fn find_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(INDEX_KEY)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let payload: Option<String> = redis::cmd("HGET")
                .arg(record_key(&id))
                .arg("record")
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            let Some(payload) = payload else {
                continue;
            };
            match serde_json::from_str::<SessionRecord>(&payload) {
                Ok(record) => out.push(record),
                Err(err) => warn!(session_id = %id, error = %err, "skipping unreadable session record"),
            }
        }
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(out)
    }
}
