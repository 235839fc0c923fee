use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::inbox::{InboxRecord, InboxRepository, NewInboxRecord};

pub struct SqliteInboxRepository {
    pool: SqlitePool,
}

impl SqliteInboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_messages (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                handler_name TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                UNIQUE(message_id, handler_name)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<InboxRecord> {
    let created_at_ts: i64 = row.get("created_at");
    let created_at = DateTime::from_timestamp_millis(created_at_ts)
        .ok_or_else(|| anyhow::anyhow!("Invalid timestamp"))?;

    Ok(InboxRecord {
        id: row.get("id"),
        message_id: row.get("message_id"),
        handler_name: row.get("handler_name"),
        created_at,
    })
}

#[async_trait]
impl InboxRepository for SqliteInboxRepository {
    async fn get_inbox_message(
        &self,
        message_id: &str,
        handler_name: &str,
    ) -> Result<Option<InboxRecord>> {
        let row = sqlx::query(
            "SELECT id, message_id, handler_name, created_at FROM inbox_messages WHERE message_id = ? AND handler_name = ?",
        )
        .bind(message_id)
        .bind(handler_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn save(&self, record: NewInboxRecord) -> Result<InboxRecord> {
        sqlx::query(
            "INSERT INTO inbox_messages (id, message_id, handler_name, created_at) VALUES (?, ?, ?, ?) ON CONFLICT(message_id, handler_name) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.message_id)
        .bind(&record.handler_name)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        // An earlier insert may have won the conflict; read back whichever
        // row is canonical.
        let row = sqlx::query(
            "SELECT id, message_id, handler_name, created_at FROM inbox_messages WHERE message_id = ? AND handler_name = ?",
        )
        .bind(&record.message_id)
        .bind(&record.handler_name)
        .fetch_one(&self.pool)
        .await?;
        row_to_record(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_repository() -> SqliteInboxRepository {
        // A single connection keeps the in-memory database alive across
        // queries.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = SqliteInboxRepository::new(pool);
        repository.init_schema().await.unwrap();
        repository
    }

    #[tokio::test]
    async fn lookup_misses_then_hits() {
        let repository = create_test_repository().await;

        assert!(repository
            .get_inbox_message("m1", "audit")
            .await
            .unwrap()
            .is_none());

        let saved = repository
            .save(NewInboxRecord {
                message_id: "m1".to_string(),
                handler_name: "audit".to_string(),
            })
            .await
            .unwrap();

        let found = repository
            .get_inbox_message("m1", "audit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, saved.id);
        assert_eq!(found.message_id, "m1");
        assert_eq!(found.handler_name, "audit");
    }

    #[tokio::test]
    async fn pairs_are_independent() {
        let repository = create_test_repository().await;

        repository
            .save(NewInboxRecord {
                message_id: "m1".to_string(),
                handler_name: "audit".to_string(),
            })
            .await
            .unwrap();

        assert!(repository
            .get_inbox_message("m1", "ship")
            .await
            .unwrap()
            .is_none());
        assert!(repository
            .get_inbox_message("m2", "audit")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn double_save_keeps_the_first_row() {
        let repository = create_test_repository().await;
        let record = NewInboxRecord {
            message_id: "m1".to_string(),
            handler_name: "audit".to_string(),
        };

        let first = repository.save(record.clone()).await.unwrap();
        let second = repository.save(record).await.unwrap();

        assert_eq!(first.id, second.id);

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM inbox_messages")
            .fetch_one(&repository.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 1);
    }
}
