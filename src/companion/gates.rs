//! 发送闸门：静音、免打扰时段、每小时限流

use chrono::{NaiveDateTime, NaiveTime};

use crate::core::StoreError;
use crate::orchestrator::MUTED_KEY;
use crate::store::Store;

pub const RATE_BUCKET_KEY: &str = "companion:rate_bucket";
pub const RATE_COUNT_KEY: &str = "companion:rate_count";

/// 闸门判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Muted,
    QuietHours,
    RateLimited,
}

/// 解析 `HH:MM`
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// 免打扰判定：start 含、end 不含；start > end 表示跨午夜；start == end 视为未启用
pub fn is_quiet(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start == end {
        false
    } else if start < end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

/// 每小时限流桶：`YYYY-MM-DD-HH`
pub fn hour_bucket(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

/// 当前桶内已发送数；桶已滚动时为 0
fn sent_in_bucket(store: &Store, bucket: &str) -> Result<u32, StoreError> {
    if store.get_state(RATE_BUCKET_KEY)?.as_deref() != Some(bucket) {
        return Ok(0);
    }
    Ok(store
        .get_state(RATE_COUNT_KEY)?
        .and_then(|c| c.parse().ok())
        .unwrap_or(0))
}

/// 记一次发送，桶滚动时计数从 1 开始；返回当前桶计数
pub fn record_send(store: &Store, now: NaiveDateTime) -> Result<u32, StoreError> {
    let bucket = hour_bucket(now);
    let count = sent_in_bucket(store, &bucket)? + 1;
    store.set_state(RATE_BUCKET_KEY, &bucket)?;
    store.set_state(RATE_COUNT_KEY, &count.to_string())?;
    Ok(count)
}

/// 按顺序检查：静音 -> 免打扰 -> 限流
pub fn check(
    store: &Store,
    now: NaiveDateTime,
    quiet: Option<(NaiveTime, NaiveTime)>,
    max_per_hour: u32,
) -> Result<Gate, StoreError> {
    if store.get_flag(MUTED_KEY)? {
        return Ok(Gate::Muted);
    }
    if let Some((start, end)) = quiet {
        if is_quiet(now.time(), start, end) {
            return Ok(Gate::QuietHours);
        }
    }
    if sent_in_bucket(store, &hour_bucket(now))? >= max_per_hour {
        return Ok(Gate::RateLimited);
    }
    Ok(Gate::Open)
}
