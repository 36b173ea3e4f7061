//! # Redis vote store
//!
//! Durable, bounded, append-only home for validated votes.
//!
//! ## Requirements
//!
//! - Append-only: no update or delete-by-key surface at all
//! - Hard byte cap: retained records never exceed the configured
//!   capacity, oldest records are evicted first to make room
//! - Atomic appends: eviction and insert happen as one unit, a
//!   record is either fully visible or absent
//! - Page index: offline analysis reads votes per page
//!
//! ## Layout
//!
//! - `votes:seq` — monotonic insertion sequence (INCR)
//! - `votes:capacity` — byte cap, written once with SET NX
//! - `votes:bytes` — running total of stored record bytes
//! - `votes:log` — list of record ids, newest at the head
//! - `votes:records` — hash, id → serialized record
//! - `votes:pages` — hash, id → page (lets eviction prune the index
//!   without decoding the record)
//! - `votes:page:<page>` — set of ids for one page
//!
//! The whole append (evict while over capacity, then insert) runs as
//! one Lua script, which Redis executes atomically. Concurrent
//! handlers therefore need no locking of their own.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::{
    aio::{ConnectionManager, ConnectionManagerConfig},
    AsyncCommands, Client, Script,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::vote::{FieldValue, Vote};

/// 5 GiB, enough for years of votes at typical record sizes.
pub const DEFAULT_CAPACITY_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const SEQ_KEY: &str = "votes:seq";
const CAPACITY_KEY: &str = "votes:capacity";
const BYTES_KEY: &str = "votes:bytes";
const LOG_KEY: &str = "votes:log";
const RECORDS_KEY: &str = "votes:records";
const PAGES_KEY: &str = "votes:pages";
const PAGE_INDEX_PREFIX: &str = "votes:page:";

const APPEND_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local cap = tonumber(redis.call('GET', KEYS[2]))
if not cap then
    return redis.error_reply('vote store is not provisioned')
end

local size = string.len(ARGV[1])
if size > cap then
    return redis.error_reply('record larger than store capacity')
end

local bytes = tonumber(redis.call('GET', KEYS[3]) or '0')
while bytes + size > cap do
    local old = redis.call('RPOP', KEYS[4])
    if not old then break end

    local old_record = redis.call('HGET', KEYS[5], old)
    if old_record then
        bytes = bytes - string.len(old_record)
    end

    local old_page = redis.call('HGET', KEYS[6], old)
    if old_page then
        redis.call('SREM', ARGV[2] .. old_page, old)
    end

    redis.call('HDEL', KEYS[5], old)
    redis.call('HDEL', KEYS[6], old)
end

redis.call('LPUSH', KEYS[4], seq)
redis.call('HSET', KEYS[5], seq, ARGV[1])
redis.call('HSET', KEYS[6], seq, ARGV[3])
redis.call('SADD', ARGV[2] .. ARGV[3], seq)
redis.call('SET', KEYS[3], bytes + size)
return seq
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("record of {size} bytes exceeds store capacity of {capacity}")]
    RecordTooLarge { size: u64, capacity: u64 },

    #[error("vote store is not provisioned")]
    NotProvisioned,

    #[error("corrupt stored record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The durable shape of one vote. Caller-supplied fields are
/// namespaced with a `q-` prefix so they can never collide with the
/// reserved columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub page: String,
    pub useful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub date: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: HashMap<String, FieldValue>,
}

impl StoredRecord {
    fn from_vote(vote: &Vote) -> Self {
        StoredRecord {
            page: vote.page.clone(),
            useful: vote.useful,
            ip: vote.ip.clone(),
            date: Utc::now(),
            fields: vote
                .fields
                .iter()
                .map(|(key, value)| (format!("q-{key}"), value.clone()))
                .collect(),
        }
    }
}

/// Persistent storage for votes.
///
/// Methods use RPITIT (`-> impl Future + Send`) rather than an
/// `async-trait` dependency. `votes_for_page` exists for the offline
/// analytics consumer; the request path only ever appends.
pub trait VoteStore: Send + Sync + 'static {
    /// Create the bounded collection and its page index if they do
    /// not exist yet. Idempotent: re-provisioning an existing store
    /// changes nothing, including its capacity.
    fn ensure_provisioned(
        &self,
        capacity_bytes: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Durably record one vote, timestamped on the server. Evicts the
    /// oldest records first whenever the insert would push retained
    /// bytes past capacity; eviction and insert are atomic.
    fn append(&self, vote: &Vote) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All retained votes for one page, in insertion order.
    fn votes_for_page(
        &self,
        page: &str,
    ) -> impl Future<Output = Result<Vec<StoredRecord>, StoreError>> + Send;
}

/// Production store backed by Redis.
#[derive(Clone)]
pub struct RedisVoteStore {
    conn: ConnectionManager,
    append_script: Arc<Script>,
}

impl RedisVoteStore {
    /// Connect to Redis. Callers treat failure as fatal; the store
    /// never retries beyond the manager's single attempt.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(100));

        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager_with_config(config).await?;

        Ok(RedisVoteStore {
            conn,
            append_script: Arc::new(Script::new(APPEND_SCRIPT)),
        })
    }
}

impl VoteStore for RedisVoteStore {
    async fn ensure_provisioned(&self, capacity_bytes: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();

        // SET NX keeps whatever capacity an earlier provisioning
        // chose. The page index sets are created lazily on append,
        // so nothing else is needed.
        let _: Option<String> = redis::cmd("SET")
            .arg(CAPACITY_KEY)
            .arg(capacity_bytes)
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn append(&self, vote: &Vote) -> Result<(), StoreError> {
        let record = StoredRecord::from_vote(vote);
        let payload = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let _: u64 = self
            .append_script
            .key(SEQ_KEY)
            .key(CAPACITY_KEY)
            .key(BYTES_KEY)
            .key(LOG_KEY)
            .key(RECORDS_KEY)
            .key(PAGES_KEY)
            .arg(&payload)
            .arg(PAGE_INDEX_PREFIX)
            .arg(&record.page)
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn votes_for_page(&self, page: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let mut conn = self.conn.clone();

        let mut ids: Vec<u64> = conn.smembers(format!("{PAGE_INDEX_PREFIX}{page}")).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort_unstable();

        // Concurrent eviction may have removed some ids between the
        // two reads; HMGET returns nil for those.
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(RECORDS_KEY)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut records = Vec::with_capacity(raw.len());
        for payload in raw.into_iter().flatten() {
            records.push(serde_json::from_str(&payload)?);
        }

        Ok(records)
    }
}

struct MemInner {
    capacity: Option<u64>,
    bytes: u64,
    next_seq: u64,
    log: VecDeque<(u64, u64, StoredRecord)>, // (seq, size, record)
    page_index: HashMap<String, Vec<u64>>,
}

/// In-memory `VoteStore` with the same byte accounting and eviction
/// behavior as the Redis backend.
///
/// Intended for unit tests; not persisted across restarts.
#[derive(Clone)]
pub struct MemVoteStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemVoteStore {
    pub fn new() -> Self {
        MemVoteStore {
            inner: Arc::new(RwLock::new(MemInner {
                capacity: None,
                bytes: 0,
                next_seq: 0,
                log: VecDeque::new(),
                page_index: HashMap::new(),
            })),
        }
    }

    /// Number of retained records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total serialized bytes currently retained.
    pub async fn total_bytes(&self) -> u64 {
        self.inner.read().await.bytes
    }
}

impl Default for MemVoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VoteStore for MemVoteStore {
    async fn ensure_provisioned(&self, capacity_bytes: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.capacity.is_none() {
            inner.capacity = Some(capacity_bytes);
        }
        Ok(())
    }

    async fn append(&self, vote: &Vote) -> Result<(), StoreError> {
        let record = StoredRecord::from_vote(vote);
        let size = serde_json::to_string(&record)?.len() as u64;

        let mut inner = self.inner.write().await;
        // Same refusal as the Lua script: appending before
        // `ensure_provisioned` is a caller bug, not a default.
        let Some(capacity) = inner.capacity else {
            return Err(StoreError::NotProvisioned);
        };

        if size > capacity {
            return Err(StoreError::RecordTooLarge { size, capacity });
        }

        while inner.bytes + size > capacity {
            let Some((old_seq, old_size, old_record)) = inner.log.pop_front() else {
                break;
            };
            inner.bytes -= old_size;
            if let Some(ids) = inner.page_index.get_mut(&old_record.page) {
                ids.retain(|&id| id != old_seq);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .page_index
            .entry(record.page.clone())
            .or_default()
            .push(seq);
        inner.log.push_back((seq, size, record));
        inner.bytes += size;

        Ok(())
    }

    async fn votes_for_page(&self, page: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;

        let Some(ids) = inner.page_index.get(page) else {
            return Ok(Vec::new());
        };

        // ids are appended in insertion order already; the log scan
        // keeps only records that survived eviction.
        Ok(inner
            .log
            .iter()
            .filter(|(seq, _, _)| ids.contains(seq))
            .map(|(_, _, record)| record.clone())
            .collect())
    }
}
