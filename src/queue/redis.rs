//! Redis-backed `QueueStore`.
//!
//! Sorted sets carry the priority ordering (`ZSET`, score = `-totalValue`
//! for the primary queue, score = due-epoch-millis for the callback
//! schedule and the processing set); a plain `SET` carries the supplier
//! exclusion lock. The pop-and-claim and claim-supplier operations are
//! each a single Lua script (`redis::Script`) so two dispatcher instances
//! racing the same Redis never observe a half-applied state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use rust_decimal::prelude::ToPrimitive;
use uuid::Uuid;

use crate::error::Result;
use crate::model::BatchId;

use super::{QueueEntry, QueueStore};

const PRIMARY_KEY: &str = "dispatch:queue:primary";
const CALLBACK_KEY: &str = "dispatch:queue:callback";
const PROCESSING_KEY: &str = "dispatch:queue:processing";
const SUPPLIER_LOCK_KEY: &str = "dispatch:suppliers:locked";

/// Pops the lowest-scored member of `primary` and moves it into
/// `processing`, stamped with `now`. Returns the member, or nil if empty.
const POP_MIN_SCRIPT: &str = r#"
local entries = redis.call('ZRANGE', KEYS[1], 0, 0)
if #entries == 0 then
    return false
end
local member = entries[1]
redis.call('ZREM', KEYS[1], member)
redis.call('ZADD', KEYS[2], ARGV[1], member)
return member
"#;

/// Adds `supplier_id` to the exclusion set if absent. Returns 1 if this
/// call performed the add (the claim succeeded), 0 if already present.
const CLAIM_SUPPLIER_SCRIPT: &str = r#"
return redis.call('SADD', KEYS[1], ARGV[1])
"#;

/// Pops every member of `callback` with score <= `now`, up to `limit`.
const DUE_CALLBACKS_SCRIPT: &str = r#"
local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #entries > 0 then
    redis.call('ZREM', KEYS[1], unpack(entries))
end
return entries
"#;

pub struct RedisQueueStore {
    conn: ConnectionManager,
    pop_min: Script,
    claim_supplier: Script,
    due_callbacks: Script,
}

impl RedisQueueStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            pop_min: Script::new(POP_MIN_SCRIPT),
            claim_supplier: Script::new(CLAIM_SUPPLIER_SCRIPT),
            due_callbacks: Script::new(DUE_CALLBACKS_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Redis sorted-set scores are IEEE-754 doubles internally, but doubles
/// represent integers up to 2^53 exactly. Scaling to whole cents and
/// truncating to `i64` before handing the score to `ZADD` avoids the
/// decimal-to-binary-float rounding a direct `Decimal::to_f64()` would
/// introduce on the fractional part (spec.md's fixed-precision-money rule).
fn score_of(d: rust_decimal::Decimal) -> i64 {
    (d * rust_decimal::Decimal::from(100))
        .round()
        .to_i64()
        .unwrap_or(if d.is_sign_negative() { i64::MIN } else { i64::MAX })
}

fn epoch_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, batch_id: BatchId, score: rust_decimal::Decimal) -> Result<()> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(PRIMARY_KEY, batch_id.to_string(), score_of(score))
            .await?;
        Ok(())
    }

    async fn pop_min(&self) -> Result<Option<QueueEntry>> {
        let mut conn = self.conn();
        let now = Utc::now().timestamp_millis();
        let member: Option<String> = self
            .pop_min
            .key(PRIMARY_KEY)
            .key(PROCESSING_KEY)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(member.and_then(|m| Uuid::parse_str(&m).ok()).map(|batch_id| QueueEntry { batch_id }))
    }

    async fn peek(&self, n: usize) -> Result<Vec<QueueEntry>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.zrange(PRIMARY_KEY, 0, (n.max(1) - 1) as isize).await?;
        Ok(members
            .into_iter()
            .filter_map(|m| Uuid::parse_str(&m).ok())
            .map(|batch_id| QueueEntry { batch_id })
            .collect())
    }

    async fn schedule_callback(&self, batch_id: BatchId, scheduled_for: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(CALLBACK_KEY, batch_id.to_string(), epoch_ms(scheduled_for))
            .await?;
        Ok(())
    }

    async fn due_callbacks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut conn = self.conn();
        let members: Vec<String> = self
            .due_callbacks
            .key(CALLBACK_KEY)
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|m| Uuid::parse_str(&m).ok())
            .map(|batch_id| QueueEntry { batch_id })
            .collect())
    }

    async fn complete(&self, batch_id: BatchId) -> Result<()> {
        let mut conn = self.conn();
        conn.zrem::<_, _, ()>(PROCESSING_KEY, batch_id.to_string()).await?;
        Ok(())
    }

    async fn claim_supplier(&self, supplier_id: Uuid) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = self
            .claim_supplier
            .key(SUPPLIER_LOCK_KEY)
            .arg(supplier_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn release_supplier(&self, supplier_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(SUPPLIER_LOCK_KEY, supplier_id.to_string()).await?;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(&[PRIMARY_KEY, CALLBACK_KEY, PROCESSING_KEY, SUPPLIER_LOCK_KEY])
            .await?;
        Ok(())
    }
}
