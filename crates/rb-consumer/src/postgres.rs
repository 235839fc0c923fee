use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::inbox::{InboxRecord, InboxRepository, NewInboxRecord};

pub struct PostgresInboxRepository {
    pool: PgPool,
}

impl PostgresInboxRepository {
    pub fn new(pool: PgPool) -> Self {
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

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<InboxRecord> {
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
impl InboxRepository for PostgresInboxRepository {
    async fn get_inbox_message(
        &self,
        message_id: &str,
        handler_name: &str,
    ) -> Result<Option<InboxRecord>> {
        let row = sqlx::query(
            "SELECT id, message_id, handler_name, created_at FROM inbox_messages WHERE message_id = $1 AND handler_name = $2",
        )
        .bind(message_id)
        .bind(handler_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn save(&self, record: NewInboxRecord) -> Result<InboxRecord> {
        sqlx::query(
            "INSERT INTO inbox_messages (id, message_id, handler_name, created_at) VALUES ($1, $2, $3, $4) ON CONFLICT (message_id, handler_name) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.message_id)
        .bind(&record.handler_name)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, message_id, handler_name, created_at FROM inbox_messages WHERE message_id = $1 AND handler_name = $2",
        )
        .bind(&record.message_id)
        .bind(&record.handler_name)
        .fetch_one(&self.pool)
        .await?;
        row_to_record(&row)
    }
}
