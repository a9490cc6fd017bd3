//! 消息去重账本、会话表与历史检索

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{dt_to_ms, ms_to_dt, Session, Store, StoredMessage};
use crate::channels::{normalize_sender, InboundMessage};
use crate::core::StoreError;

/// 转义 LIKE 通配符，配合 `ESCAPE '\'` 使用，防止用户输入的 `%` / `_` 被当作通配
pub fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl Store {
    /// 账本 insert-if-absent：新插入返回 true，已存在（重复投递）返回 false
    ///
    /// sender 列保存归一化后的地址，与会话、Run、审批使用同一个键。
    pub fn record_message(&self, hash: &str, msg: &InboundMessage) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages
                 (hash, message_id, sender, channel, text, is_from_me, received_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    hash,
                    msg.id,
                    normalize_sender(&msg.sender),
                    msg.channel,
                    msg.text,
                    msg.is_from_me as i64,
                    dt_to_ms(msg.received_at),
                    dt_to_ms(Utc::now()),
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    /// 撤销一条账本记录，让处理失败的消息在下一轮重新投递时不被当作重复
    pub fn forget_message(&self, hash: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM messages WHERE hash = ?1", params![hash])? == 1))
    }

    /// 记录一次来访：计数 +1、刷新 last_seen；thread_id 为 None 时保留原值
    pub fn upsert_session(&self, sender: &str, thread_id: Option<&str>) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (sender, thread_id, message_count, last_seen_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(sender) DO UPDATE SET
                    thread_id = COALESCE(excluded.thread_id, sessions.thread_id),
                    message_count = sessions.message_count + 1,
                    last_seen_at = excluded.last_seen_at",
                params![sender, thread_id, dt_to_ms(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// 仅替换线程 ID（clear_context 用），不计数
    pub fn set_session_thread(&self, sender: &str, thread_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (sender, thread_id, message_count, last_seen_at)
                 VALUES (?1, ?2, 0, ?3)
                 ON CONFLICT(sender) DO UPDATE SET thread_id = excluded.thread_id",
                params![sender, thread_id, dt_to_ms(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, sender: &str) -> Result<Option<Session>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT sender, thread_id, message_count, last_seen_at FROM sessions WHERE sender = ?1",
                    params![sender],
                    |row| {
                        Ok(Session {
                            sender: row.get(0)?,
                            thread_id: row.get(1)?,
                            message_count: row.get(2)?,
                            last_seen_at: ms_to_dt(row.get(3)?),
                        })
                    },
                )
                .optional()?)
        })
    }

    /// 历史检索：子串匹配，查询词中的通配符按字面处理；按时间倒序
    pub fn search_messages(
        &self,
        sender: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, sender, channel, text, received_at FROM messages
                 WHERE text LIKE ?1 ESCAPE '\\' AND (?2 IS NULL OR sender = ?2)
                 ORDER BY received_at DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![pattern, sender, limit as i64], |row| {
                Ok(StoredMessage {
                    message_id: row.get(0)?,
                    sender: row.get(1)?,
                    channel: row.get(2)?,
                    text: row.get(3)?,
                    received_at: ms_to_dt(row.get(4)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn count_messages_since(
        &self,
        sender: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE sender = ?1 AND received_at >= ?2",
                params![sender, dt_to_ms(since)],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, sender: &str, text: &str) -> InboundMessage {
        InboundMessage::new(id, sender, text, "console")
    }

    #[test]
    fn test_like_escape() {
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_record_message_is_insert_if_absent() {
        let store = Store::open_in_memory().unwrap();
        let m = msg("1", "+1555", "hello");
        let hash = m.dedupe_hash();
        assert!(store.record_message(&hash, &m).unwrap());
        assert!(!store.record_message(&hash, &m).unwrap());

        assert!(store.forget_message(&hash).unwrap());
        assert!(!store.forget_message(&hash).unwrap());
        assert!(store.record_message(&hash, &m).unwrap());
    }

    #[test]
    fn test_ledger_keys_on_normalized_sender() {
        let store = Store::open_in_memory().unwrap();
        let a = msg("1", "tel:+1555", "budget numbers");
        let b = msg("2", "+1555", "budget review");
        store.record_message(&a.dedupe_hash(), &a).unwrap();
        store.record_message(&b.dedupe_hash(), &b).unwrap();

        let hits = store.search_messages(Some("+1555"), "budget", 10).unwrap();
        assert_eq!(hits.len(), 2);
        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.count_messages_since("+1555", since).unwrap(), 2);
    }

    #[test]
    fn test_search_treats_wildcards_literally() {
        let store = Store::open_in_memory().unwrap();
        for (i, text) in ["growth 100% done", "growth 1000 done", "snake_case", "snakeXcase"]
            .iter()
            .enumerate()
        {
            let m = msg(&i.to_string(), "+1555", text);
            store.record_message(&m.dedupe_hash(), &m).unwrap();
        }
        let hits = store.search_messages(None, "100%", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "growth 100% done");

        let hits = store.search_messages(Some("+1555"), "snake_case", 10).unwrap();
        assert_eq!(hits.len(), 1);

        let hits = store.search_messages(Some("someone-else"), "snake", 10).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_sessions() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_session("+1555", Some("thread-a")).unwrap();
        store.upsert_session("+1555", None).unwrap();
        let s = store.get_session("+1555").unwrap().unwrap();
        assert_eq!(s.thread_id.as_deref(), Some("thread-a"));
        assert_eq!(s.message_count, 2);

        store.set_session_thread("+1555", "thread-b").unwrap();
        let s = store.get_session("+1555").unwrap().unwrap();
        assert_eq!(s.thread_id.as_deref(), Some("thread-b"));
        assert_eq!(s.message_count, 2);
    }
}
