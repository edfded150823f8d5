//! Local storage using SQLite

use crate::error::Result;
use crate::models::*;
use log::warn;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SEARCH_HISTORY_LIMIT: usize = 10;

pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("voxlink.db"))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS search_history (
                query TEXT PRIMARY KEY,
                searched_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_search_history_time ON search_history(searched_at);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ========================================================================
    // Theme
    // ========================================================================

    pub fn theme(&self) -> Result<Theme> {
        let theme = match self.get_setting("theme")? {
            Some(value) => Theme::parse(&value).unwrap_or_else(|| {
                warn!("Unknown theme {:?} in settings", value);
                Theme::default()
            }),
            None => Theme::default(),
        };
        Ok(theme)
    }

    pub fn set_theme(&self, theme: Theme) -> Result<()> {
        self.save_setting("theme", theme.as_str())
    }

    // ========================================================================
    // Search history
    // ========================================================================

    /// Records a query as the most recent search. Repeated queries move to
    /// the front; only the newest entries are kept.
    pub fn add_search(&self, query: &str) -> Result<()> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(searched_at), 0) + 1 FROM search_history",
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO search_history (query, searched_at) VALUES (?1, ?2)",
            params![query, next],
        )?;
        tx.execute(
            "DELETE FROM search_history WHERE query NOT IN (
                SELECT query FROM search_history ORDER BY searched_at DESC LIMIT ?1
            )",
            params![SEARCH_HISTORY_LIMIT as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent first.
    pub fn search_history(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT query FROM search_history ORDER BY searched_at DESC")?;
        let queries = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(queries)
    }

    pub fn clear_search_history(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM search_history", [])?;
        Ok(())
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn save_session(&self, session: &AuthSession) -> Result<()> {
        self.save_setting("session", &serde_json::to_string(session)?)
    }

    pub fn load_session(&self) -> Result<Option<AuthSession>> {
        match self.get_setting("session")? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn clear_session(&self) -> Result<()> {
        self.delete_setting("session")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_theme_defaults_to_dark() {
        let storage = LocalStorage::in_memory().unwrap();
        assert_eq!(storage.theme().unwrap(), Theme::Dark);
        storage.set_theme(Theme::Light).unwrap();
        assert_eq!(storage.theme().unwrap(), Theme::Light);
    }

    #[test]
    fn test_search_history_dedup_and_cap() {
        let storage = LocalStorage::in_memory().unwrap();
        for i in 0..12 {
            storage.add_search(&format!("query {}", i)).unwrap();
        }
        storage.add_search("query 5").unwrap();
        storage.add_search("   ").unwrap();

        let history = storage.search_history().unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0], "query 5");
        assert_eq!(history[1], "query 11");
        assert_eq!(history.iter().filter(|q| *q == "query 5").count(), 1);
        assert!(!history.contains(&"query 0".to_string()));
    }

    #[test]
    fn test_session_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let session = AuthSession {
            token: "t0k".to_string(),
            user: UserInfo::new("U1", "Ann"),
            expires_at: Some(1_700_000_000),
        };

        {
            let storage = LocalStorage::new(dir.path()).unwrap();
            storage.save_session(&session).unwrap();
        }

        let storage = LocalStorage::new(dir.path()).unwrap();
        let loaded = storage.load_session().unwrap().unwrap();
        assert_eq!(loaded.user, session.user);
        assert_eq!(loaded.token, "t0k");

        storage.clear_session().unwrap();
        assert!(storage.load_session().unwrap().is_none());
    }
}
