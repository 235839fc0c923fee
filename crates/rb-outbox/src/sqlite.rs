use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use rb_common::{OutboundMessage, OutboundStatus};
use sqlx::{Row, SqlitePool};

use crate::repository::OutboxRepository;

const SELECT_COLUMNS: &str = "id, message_id, exchange, routing_key, message_type, \
     headers, properties, body, status, sent_at, created_at, updated_at";

pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
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

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<OutboundMessage> {
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
impl OutboxRepository for SqliteOutboxRepository {
    async fn get_unsent_messages(&self, limit: u32) -> Result<Vec<OutboundMessage>> {
        let limit = if limit == 0 { i64::MAX } else { i64::from(limit) };
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_messages WHERE status = ? ORDER BY created_at ASC LIMIT ?",
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
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
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
            "SELECT {} FROM outbox_messages WHERE id = ?",
            SELECT_COLUMNS
        ))
        .bind(&message.id)
        .fetch_one(&self.pool)
        .await?;
        row_to_message(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rb_common::DeliveryProperties;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_repository() -> SqliteOutboxRepository {
        // A single connection keeps the in-memory database alive across
        // queries.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = SqliteOutboxRepository::new(pool);
        repository.init_schema().await.unwrap();
        repository
    }

    async fn count_rows(repository: &SqliteOutboxRepository) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM outbox_messages")
            .fetch_one(&repository.pool)
            .await
            .unwrap()
            .get("n")
    }

    #[tokio::test]
    async fn pending_roundtrip_preserves_payload() {
        let repository = create_test_repository().await;

        let mut headers = serde_json::Map::new();
        headers.insert("tenant".to_string(), json!("acme"));
        let message = OutboundMessage::new(
            "orders",
            "order.created",
            "order.created",
            json!({"order_id": 7}),
        )
        .with_headers(headers.clone())
        .with_properties(DeliveryProperties {
            correlation_id: Some("c1".to_string()),
            ..Default::default()
        });

        repository.save(&message).await.unwrap();

        let unsent = repository.get_unsent_messages(10).await.unwrap();
        assert_eq!(unsent.len(), 1);
        let loaded = &unsent[0];
        assert_eq!(loaded.id, message.id);
        assert_eq!(loaded.message_id, message.message_id);
        assert_eq!(loaded.exchange, "orders");
        assert_eq!(loaded.message_type, "order.created");
        assert_eq!(loaded.headers, headers);
        assert_eq!(loaded.properties.correlation_id.as_deref(), Some("c1"));
        assert_eq!(loaded.body, json!({"order_id": 7}));
        assert!(loaded.is_pending());
        assert!(loaded.sent_at.is_none());
    }

    #[tokio::test]
    async fn sent_messages_leave_the_unsent_feed() {
        let repository = create_test_repository().await;
        let mut message = OutboundMessage::new("orders", "", "order.created", json!({}));

        repository.save(&message).await.unwrap();
        message.mark_as_sent().unwrap();
        let saved = repository.save(&message).await.unwrap();

        assert!(!saved.is_pending());
        assert!(saved.sent_at.is_some());
        assert!(repository.get_unsent_messages(10).await.unwrap().is_empty());
        assert_eq!(count_rows(&repository).await, 1);
    }

    #[tokio::test]
    async fn fetch_is_oldest_first_and_capped() {
        let repository = create_test_repository().await;
        let newer = OutboundMessage::new("orders", "newer", "order.created", json!({}));
        let mut older = OutboundMessage::new("orders", "older", "order.created", json!({}));
        older.created_at = newer.created_at - Duration::seconds(30);

        repository.save(&newer).await.unwrap();
        repository.save(&older).await.unwrap();

        let capped = repository.get_unsent_messages(1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].routing_key, "older");

        // Zero means no cap.
        let all = repository.get_unsent_messages(0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].routing_key, "older");
        assert_eq!(all[1].routing_key, "newer");
    }

    #[tokio::test]
    async fn upsert_does_not_duplicate_rows() {
        let repository = create_test_repository().await;
        let message = OutboundMessage::new("orders", "", "order.created", json!({}));

        repository.save(&message).await.unwrap();
        repository.save(&message).await.unwrap();

        assert_eq!(count_rows(&repository).await, 1);
    }
}
