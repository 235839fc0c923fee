use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use rb_common::{OutboundMessage, OutboundStatus};
use sqlx::{PgPool, Row};

use crate::repository::OutboxRepository;

const SELECT_COLUMNS: &str = "id, message_id, exchange, routing_key, message_type, \
     headers, properties, body, status, sent_at, created_at, updated_at";

pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_messages (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                exchange TEXT NOT NULL,
                routing_key TEXT NOT NULL,
                message_type TEXT NOT NULL,
                headers TEXT NOT NULL,
                properties TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                sent_at BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_unsent ON outbox_messages(status, created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboundMessage> {
    let headers_json: String = row.get("headers");
    let properties_json: String = row.get("properties");
    let body_json: String = row.get("body");
    let status_text: String = row.get("status");

    let created_at_ts: i64 = row.get("created_at");
    let updated_at_ts: i64 = row.get("updated_at");
    let sent_at_ts: Option<i64> = row.get("sent_at");

    let created_at = DateTime::from_timestamp_millis(created_at_ts)
        .ok_or_else(|| anyhow::anyhow!("Invalid timestamp"))?;
    let updated_at = DateTime::from_timestamp_millis(updated_at_ts)
        .ok_or_else(|| anyhow::anyhow!("Invalid timestamp"))?;
    let sent_at = match sent_at_ts {
        Some(ts) => Some(
            DateTime::from_timestamp_millis(ts)
                .ok_or_else(|| anyhow::anyhow!("Invalid timestamp"))?,
        ),
        None => None,
    };

    Ok(OutboundMessage {
        id: row.get("id"),
        message_id: row.get("message_id"),
        exchange: row.get("exchange"),
        routing_key: row.get("routing_key"),
        message_type: row.get("message_type"),
        headers: serde_json::from_str(&headers_json)?,
        properties: serde_json::from_str(&properties_json)?,
        body: serde_json::from_str(&body_json)?,
        status: status_text.parse()?,
        sent_at,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn get_unsent_messages(&self, limit: u32) -> Result<Vec<OutboundMessage>> {
        let limit = if limit == 0 { i64::MAX } else { i64::from(limit) };
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_messages WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(OutboundStatus::PENDING.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn save(&self, message: &OutboundMessage) -> Result<OutboundMessage> {
        // Identity columns never change after insert; the upsert only
        // refreshes the mutable ones.
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id, message_id, exchange, routing_key, message_type,
                headers, properties, body, status, sent_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                headers = excluded.headers,
                properties = excluded.properties,
                body = excluded.body,
                status = excluded.status,
                sent_at = excluded.sent_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&message.id)
        .bind(&message.message_id)
        .bind(&message.exchange)
        .bind(&message.routing_key)
        .bind(&message.message_type)
        .bind(serde_json::to_string(&message.headers)?)
        .bind(serde_json::to_string(&message.properties)?)
        .bind(serde_json::to_string(&message.body)?)
        .bind(message.status.as_str())
        .bind(message.sent_at.map(|t| t.timestamp_millis()))
        .bind(message.created_at.timestamp_millis())
        .bind(message.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM outbox_messages WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(&message.id)
        .fetch_one(&self.pool)
        .await?;
        row_to_message(&row)
    }
}
