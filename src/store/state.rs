//! 通用 KV 状态：游标、静音标志、限流桶、摘要标记、冷却键

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{dt_to_ms, Store};
use crate::core::StoreError;

impl Store {
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, dt_to_ms(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT value FROM kv_state WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }

    pub fn delete_state(&self, key: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM kv_state WHERE key = ?1", params![key])? > 0)
        })
    }

    /// 布尔标志："1" / "true" / "yes" 视为真
    pub fn get_flag(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .get_state(key)?
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false))
    }

    pub fn set_flag(&self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set_state(key, if value { "1" } else { "0" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_overwrite_delete() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_state("k").unwrap(), None);
        store.set_state("k", "a").unwrap();
        store.set_state("k", "b").unwrap();
        assert_eq!(store.get_state("k").unwrap().as_deref(), Some("b"));
        assert!(store.delete_state("k").unwrap());
        assert!(!store.delete_state("k").unwrap());
    }

    #[test]
    fn test_flags() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.get_flag("companion:muted").unwrap());
        store.set_flag("companion:muted", true).unwrap();
        assert!(store.get_flag("companion:muted").unwrap());
        store.set_state("companion:muted", "TRUE").unwrap();
        assert!(store.get_flag("companion:muted").unwrap());
        store.set_flag("companion:muted", false).unwrap();
        assert!(!store.get_flag("companion:muted").unwrap());
    }
}
