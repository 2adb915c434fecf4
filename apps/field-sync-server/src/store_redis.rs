//! Redis backend. Each field is a hash; a per-session sorted set scored by
//! `updated_at_ms` is the `(session, updated_at)` index used by the feed.
//! The compare-and-swap runs as a Lua script so the revision check and the
//! write are one atomic step on the server.

use std::collections::HashMap;

use async_trait::async_trait;
use field_store::{FieldKey, FieldRecord, FieldStore, StoreError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'revision')
if ARGV[1] == '' then
  if current then return 0 end
elseif current ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1],
  'value', ARGV[2],
  'owner_user_id', ARGV[3],
  'updated_at_ms', ARGV[4],
  'revision', ARGV[5])
if ARGV[6] ~= '' then
  redis.call('HSET', KEYS[1], 'locked_by', ARGV[6], 'lease_at_ms', ARGV[7])
end
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[8])
return 1
"#;

pub struct RedisFieldStore {
    conn: ConnectionManager,
    cas: Script,
}

impl RedisFieldStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(to_store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(to_store_err)?;
        Ok(Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    async fn load_many(
        &self,
        session_code: &str,
        field_ids: Vec<String>,
    ) -> Result<Vec<FieldRecord>, StoreError> {
        if field_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for field_id in &field_ids {
            pipe.hgetall(row_key(session_code, field_id));
        }
        let maps: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(to_store_err)?;
        let mut out = Vec::with_capacity(maps.len());
        for (field_id, map) in field_ids.into_iter().zip(maps) {
            let key = FieldKey::new(session_code, field_id);
            if let Some(record) = record_from_hash(&key, map)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl FieldStore for RedisFieldStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn load(&self, key: &FieldKey) -> Result<Option<FieldRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(row_key(&key.session_code, &key.field_id))
            .await
            .map_err(to_store_err)?;
        record_from_hash(key, map)
    }

    async fn compare_and_swap(
        &self,
        expected_revision: Option<u64>,
        next: &FieldRecord,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(row_key(&next.session_code, &next.field_id))
            .key(index_key(&next.session_code))
            .arg(expected_revision.map(|r| r.to_string()).unwrap_or_default())
            .arg(&next.value)
            .arg(&next.owner_user_id)
            .arg(next.updated_at_ms)
            .arg(next.revision)
            .arg(next.locked_by.as_deref().unwrap_or(""))
            .arg(next.lease_at_ms.unwrap_or(0))
            .arg(&next.field_id)
            .invoke_async(&mut conn)
            .await
            .map_err(to_store_err)?;
        Ok(swapped == 1)
    }

    async fn session_rows(&self, session_code: &str) -> Result<Vec<FieldRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(index_key(session_code), 0, -1)
            .await
            .map_err(to_store_err)?;
        self.load_many(session_code, ids).await
    }

    async fn changed_since(
        &self,
        session_code: &str,
        since_ms: u64,
    ) -> Result<Vec<FieldRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(index_key(session_code), since_ms, "+inf")
            .await
            .map_err(to_store_err)?;
        self.load_many(session_code, ids).await
    }
}

fn row_key(session_code: &str, field_id: &str) -> String {
    format!("fieldsync:{}:field:{}", session_code, field_id)
}

fn index_key(session_code: &str) -> String {
    format!("fieldsync:{}:updated", session_code)
}

fn record_from_hash(
    key: &FieldKey,
    mut map: HashMap<String, String>,
) -> Result<Option<FieldRecord>, StoreError> {
    if map.is_empty() {
        return Ok(None);
    }
    let number = |map: &HashMap<String, String>, name: &str| -> Result<u64, StoreError> {
        map.get(name)
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("missing or invalid {name}"),
            })
    };
    let revision = number(&map, "revision")?;
    let updated_at_ms = number(&map, "updated_at_ms")?;
    let locked_by = map.remove("locked_by").filter(|v| !v.is_empty());
    let lease_at_ms = match locked_by {
        Some(_) => Some(number(&map, "lease_at_ms")?),
        None => None,
    };
    Ok(Some(FieldRecord {
        session_code: key.session_code.clone(),
        field_id: key.field_id.clone(),
        value: map.remove("value").unwrap_or_default(),
        locked_by,
        lease_at_ms,
        updated_at_ms,
        owner_user_id: map.remove("owner_user_id").unwrap_or_default(),
        revision,
    }))
}

fn to_store_err(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}
