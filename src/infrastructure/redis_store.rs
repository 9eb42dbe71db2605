//! Redis-backed Counter Store.
//!
//! Lets several processes share rate limits and idempotency records.
//!
//! ## Layout
//!
//! Every store key maps to one Redis hash under a configurable prefix:
//! - window counters: `start`, `count`, `prev`, `window` (milliseconds)
//! - idempotency records: `state`, `lease`, `result`, `created`, `expires`
//!
//! Lease tokens come from one `INCR` sequence under the prefix, so tokens
//! are unique across every process sharing the server.
//!
//! Counter increments, lease acquisition and the lease-checked complete and
//! release run as Lua scripts, so each is a single atomic step on the
//! server. Hashes carry a `PEXPIRE` matching their useful lifetime; Redis
//! evicts them, so [`purge_expired`] has nothing to do.
//!
//! Times come from the store's [`Clock`], not the Redis server, so window
//! boundaries agree with every other component using the same clock.
//!
//! ## Sync bridging
//!
//! [`CounterStore`] is synchronous. Inside a multi-threaded tokio runtime
//! calls go through `block_in_place`; outside any runtime a temporary
//! current-thread runtime is created per call. `block_in_place` is not
//! available on a current-thread runtime, so calls made from one fail with
//! `BackendUnavailable` instead of blocking the only worker.
//!
//! ## Example
//!
//! ```rust,ignore
//! use request_governance::{GovernorBuilder, RedisStore, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let clock = Arc::new(SystemClock::new());
//!     let store = RedisStore::connect("redis://127.0.0.1/", clock.clone())
//!         .await
//!         .expect("Failed to connect to Redis");
//!
//!     let governor = GovernorBuilder::new()
//!         .clock(clock)
//!         .store(Arc::new(store))
//!         .build()
//!         .unwrap();
//! }
//! ```
//!
//! [`purge_expired`]: CounterStore::purge_expired

use crate::application::ports::{Clock, CounterStore, StoreError};
use crate::domain::record::{IdempotencyRecord, LeaseToken, RecordState};
use crate::domain::window::{epoch_millis, from_epoch_millis, WindowSnapshot};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const INCREMENT_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local aligned = now - (now % window)
local v = redis.call('HMGET', KEYS[1], 'start', 'count', 'prev', 'window')
local start = tonumber(v[1])
local count = tonumber(v[2]) or 0
local prev = tonumber(v[3]) or 0
if start == nil or tonumber(v[4]) ~= window then
  start = aligned
  count = 0
  prev = 0
elseif aligned > start then
  if aligned == start + window then prev = count else prev = 0 end
  count = 0
  start = aligned
end
count = count + 1
redis.call('HSET', KEYS[1], 'start', string.format('%d', start), 'count', count, 'prev', prev, 'window', ARGV[2])
redis.call('PEXPIRE', KEYS[1], window * 2)
return {count, prev, string.format('%d', start)}
";

const ACQUIRE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local expires = tonumber(redis.call('HGET', KEYS[1], 'expires') or '0')
if expires > now then
  return 0
end
local lease = redis.call('INCR', KEYS[2])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'state', 'pending', 'lease', lease, 'created', ARGV[1], 'expires', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return lease
";

// Shared guard: KEYS[1] is pending, leased to ARGV[1], and unexpired at ARGV[2].
const HELD_CHECK: &str = r"
local v = redis.call('HMGET', KEYS[1], 'state', 'lease', 'expires')
if v[1] ~= 'pending' or v[2] ~= ARGV[1] or tonumber(v[3] or '0') <= tonumber(ARGV[2]) then
  return 0
end
";

const COMPLETE_HELD_BODY: &str = r"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'state', 'completed', 'result', ARGV[3], 'created', ARGV[2], 'expires', ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 1
";

const RELEASE_HELD_BODY: &str = r"
redis.call('DEL', KEYS[1])
return 1
";

const LEASE_SEQUENCE: &str = "lease-seq";

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every Redis key (default: "request-governance:")
    pub key_prefix: String,
    /// Keys fetched per `SCAN` page during [`reset`](CounterStore::reset).
    pub scan_count: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "request-governance:".to_string(),
            scan_count: 100,
        }
    }
}

/// Counter Store shared across processes through Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    clock: Arc<dyn Clock>,
    increment: Arc<Script>,
    acquire: Arc<Script>,
    complete_held: Arc<Script>,
    release_held: Arc<Script>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str, clock: Arc<dyn Clock>) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default(), clock).await
    }

    /// Connect with custom configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            config,
            clock,
            increment: Arc::new(Script::new(INCREMENT_SCRIPT)),
            acquire: Arc::new(Script::new(ACQUIRE_SCRIPT)),
            complete_held: Arc::new(Script::new(&format!("{}{}", HELD_CHECK, COMPLETE_HELD_BODY))),
            release_held: Arc::new(Script::new(&format!("{}{}", HELD_CHECK, RELEASE_HELD_BODY))),
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn now_ms(&self) -> u64 {
        epoch_millis(self.clock.now())
    }

    async fn increment_async(
        &self,
        key: &str,
        window_ms: u64,
    ) -> Result<WindowSnapshot, RedisError> {
        let mut conn = self.connection.clone();
        let (count, previous, start): (u64, u64, u64) = self
            .increment
            .key(self.key(key))
            .arg(self.now_ms())
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowSnapshot {
            count,
            previous,
            window_start: from_epoch_millis(start),
        })
    }

    async fn acquire_async(
        &self,
        key: &str,
        lease_ms: u64,
    ) -> Result<Option<LeaseToken>, RedisError> {
        let mut conn = self.connection.clone();
        let now = self.now_ms();
        let lease: u64 = self
            .acquire
            .key(self.key(key))
            .key(self.key(LEASE_SEQUENCE))
            .arg(now)
            .arg(now.saturating_add(lease_ms))
            .arg(lease_ms.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok((lease > 0).then(|| LeaseToken::new(lease)))
    }

    async fn complete_held_async(
        &self,
        key: &str,
        lease: LeaseToken,
        result: &[u8],
        ttl_ms: u64,
    ) -> Result<bool, RedisError> {
        let mut conn = self.connection.clone();
        let now = self.now_ms();
        let written: i64 = self
            .complete_held
            .key(self.key(key))
            .arg(lease.get())
            .arg(now)
            .arg(result)
            .arg(now.saturating_add(ttl_ms))
            .arg(ttl_ms.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn release_held_async(&self, key: &str, lease: LeaseToken) -> Result<bool, RedisError> {
        let mut conn = self.connection.clone();
        let released: i64 = self
            .release_held
            .key(self.key(key))
            .arg(lease.get())
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn complete_async(
        &self,
        key: &str,
        result: &[u8],
        ttl_ms: u64,
    ) -> Result<(), RedisError> {
        let mut conn = self.connection.clone();
        let redis_key = self.key(key);
        let now = self.now_ms();

        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&redis_key)
            .ignore()
            .cmd("HSET")
            .arg(&redis_key)
            .arg("state")
            .arg(RecordState::Completed.as_str())
            .arg("result")
            .arg(result)
            .arg("created")
            .arg(now)
            .arg("expires")
            .arg(now.saturating_add(ttl_ms))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&redis_key)
            .arg(ttl_ms.max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_async(&self, key: &str) -> Result<Option<IdempotencyRecord>, RedisError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;

        let Some(record) = parse_record(key, &fields) else {
            if !fields.is_empty() {
                tracing::warn!(key, "discarding malformed idempotency record");
            }
            return Ok(None);
        };
        if record.is_expired(self.clock.now()) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn release_async(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset_async(&self) -> Result<(), RedisError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.config.key_prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.config.scan_count)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let _: () = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await?;
            }
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }

    /// Run a Redis future to completion from synchronous code.
    fn block_on<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, StoreError> {
        let result = if let Ok(handle) = tokio::runtime::Handle::try_current() {
            // block_in_place panics on a current-thread runtime.
            if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
                tracing::warn!(op, "redis store called from a current-thread runtime");
                return Err(StoreError::unavailable(
                    "redis store requires a multi-thread tokio runtime",
                ));
            }
            tokio::task::block_in_place(|| handle.block_on(fut))
        } else {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(StoreError::unavailable)?;
            rt.block_on(fut)
        };

        result.map_err(|e| {
            tracing::warn!(op, error = %e, "redis operation failed");
            StoreError::unavailable(e)
        })
    }
}

fn parse_u64(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<u64> {
    std::str::from_utf8(fields.get(name)?).ok()?.parse().ok()
}

fn parse_record(key: &str, fields: &HashMap<String, Vec<u8>>) -> Option<IdempotencyRecord> {
    let state = RecordState::parse(std::str::from_utf8(fields.get("state")?).ok()?)?;
    let created = from_epoch_millis(parse_u64(fields, "created")?);
    let expires = from_epoch_millis(parse_u64(fields, "expires")?);

    Some(match state {
        RecordState::Pending => IdempotencyRecord::pending(
            key,
            LeaseToken::new(parse_u64(fields, "lease")?),
            created,
            expires,
        ),
        RecordState::Completed => IdempotencyRecord::completed(
            key,
            fields.get("result").cloned().unwrap_or_default(),
            created,
            expires,
        ),
    })
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl CounterStore for RedisStore {
    fn increment_and_check(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError> {
        let window_ms = millis(window).max(1);
        self.block_on("increment", self.increment_async(key, window_ms))
    }

    fn acquire_lease(
        &self,
        key: &str,
        lease: Duration,
    ) -> Result<Option<LeaseToken>, StoreError> {
        self.block_on("acquire", self.acquire_async(key, millis(lease)))
    }

    fn complete(&self, key: &str, result: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.block_on("complete", self.complete_async(key, result, millis(ttl)))
    }

    fn complete_if_held(
        &self,
        key: &str,
        lease: LeaseToken,
        result: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.block_on(
            "complete_if_held",
            self.complete_held_async(key, lease, result, millis(ttl)),
        )
    }

    fn read(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.block_on("read", self.read_async(key))
    }

    fn release(&self, key: &str) -> Result<(), StoreError> {
        self.block_on("release", self.release_async(key))
    }

    fn release_if_held(&self, key: &str, lease: LeaseToken) -> Result<bool, StoreError> {
        self.block_on("release_if_held", self.release_held_async(key, lease))
    }

    /// Redis expires hashes on its own.
    fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.block_on("reset", self.reset_async())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_parse_completed_record() {
        let record = parse_record(
            "gov:idem:k",
            &fields(&[
                ("state", b"completed"),
                ("result", b"{\"id\":1}"),
                ("created", b"1700006400000"),
                ("expires", b"1700092800000"),
            ]),
        )
        .unwrap();

        assert_eq!(record.state, RecordState::Completed);
        assert_eq!(record.result.as_deref(), Some(&b"{\"id\":1}"[..]));
        assert_eq!(record.created_at, from_epoch_millis(1_700_006_400_000));
        assert_eq!(record.expires_at, from_epoch_millis(1_700_092_800_000));
    }

    #[test]
    fn test_parse_pending_record() {
        let record = parse_record(
            "k",
            &fields(&[
                ("state", b"pending"),
                ("lease", b"12"),
                ("created", b"1000"),
                ("expires", b"31000"),
            ]),
        )
        .unwrap();
        assert_eq!(record.state, RecordState::Pending);
        assert_eq!(record.lease, Some(LeaseToken::new(12)));
        assert!(record.result.is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_record("k", &HashMap::new()).is_none());
        assert!(parse_record("k", &fields(&[("state", b"weird")])).is_none());
        assert!(parse_record(
            "k",
            &fields(&[
                ("state", b"pending"),
                ("lease", b"1"),
                ("created", b"x"),
                ("expires", b"1")
            ])
        )
        .is_none());
        // A pending record without its holder's token cannot be settled.
        assert!(parse_record(
            "k",
            &fields(&[("state", b"pending"), ("created", b"1"), ("expires", b"2")])
        )
        .is_none());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(30)), 30_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
