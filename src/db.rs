//! SQLite backing for saved quest state.
//!
//! One row per quest id holding the JSON payload written by the engine. The
//! engine itself only talks to the in-memory store; the host loads every row
//! at startup and flushes dirty entries back here.

use std::collections::HashMap;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{error, info};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quest_state (
                quest_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Every saved entry, keyed by quest id
    pub async fn load_all(&self) -> Result<HashMap<String, String>, sqlx::Error> {
        let rows = sqlx::query("SELECT quest_id, payload FROM quest_state")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            let quest_id: String = row.get("quest_id");
            let payload: String = row.get("payload");
            entries.insert(quest_id, payload);
        }
        Ok(entries)
    }

    pub async fn save_entry(&self, quest_id: &str, payload: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO quest_state (quest_id, payload, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(quest_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(quest_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write each entry independently. Returns the keys that failed.
    pub async fn save_entries(&self, entries: &[(String, String)]) -> Vec<String> {
        let mut failed = Vec::new();
        for (quest_id, payload) in entries {
            if let Err(e) = self.save_entry(quest_id, payload).await {
                error!("Failed to persist quest {}: {}", quest_id, e);
                failed.push(quest_id.clone());
            }
        }
        failed
    }
}
