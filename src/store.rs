use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::errors::StoreError;
use crate::types::{AssistantPersona, ChannelCredentials, Conversation, ConversationMessage};

pub const UPSERT_RETRIES: u32 = 3;
pub const UPSERT_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Storage seam for the sync and webhook pipelines. Production runs on
/// Postgres; tests run an in-memory implementation with failure injection.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Insert keyed by the message's stable id; an existing row with the
    /// same id is left untouched, which is what absorbs replayed webhook
    /// deliveries.
    async fn upsert_message(&self, message: &ConversationMessage) -> Result<(), StoreError>;

    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn conversation_for_recipient(
        &self,
        user_id: &str,
        recipient_page_scope_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError>;

    /// Returns false when no such conversation exists.
    async fn set_ai_mode(&self, conversation_id: &str, enabled: bool) -> Result<bool, StoreError>;

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: &str,
    ) -> Result<(), StoreError>;

    /// All messages of a conversation, `date` ascending.
    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>, StoreError>;

    /// The most recent `limit` messages, `date` descending.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationMessage>, StoreError>;

    async fn channel_by_page_name(
        &self,
        page_name: &str,
    ) -> Result<Option<ChannelCredentials>, StoreError>;

    async fn persona_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<AssistantPersona>, StoreError>;
}

/// Runs `op` up to `retries` times total, sleeping `delay` between
/// attempts and logging each failure. The final error propagates. This is
/// the only retry site in the whole pipeline.
pub async fn with_retries<T, E, F, Fut>(retries: u32, delay: Duration, op: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("write attempt {attempt}/{retries} failed: {err}");
                if attempt >= retries {
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub async fn retry_upsert_conversation(
    store: &dyn ChatStore,
    conversation: &Conversation,
    retries: u32,
    delay: Duration,
) -> Result<(), StoreError> {
    with_retries(retries, delay, || store.upsert_conversation(conversation)).await
}

pub async fn retry_upsert_message(
    store: &dyn ChatStore,
    message: &ConversationMessage,
    retries: u32,
    delay: Duration,
) -> Result<(), StoreError> {
    with_retries(retries, delay, || store.upsert_message(message)).await
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn conversation_from_row(row: sqlx::postgres::PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        recipient_page_scope_id: row.get("recipient_page_scope_id"),
        ai_mode: row.get("ai_mode"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn message_from_row(row: sqlx::postgres::PgRow) -> ConversationMessage {
    ConversationMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        content: row.get("content"),
        sender: row.get("sender"),
        source: row.get("source"),
        sent_by_ai: row.get("sent_by_ai"),
        date: row.get("date"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, recipient_page_scope_id, ai_mode, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                recipient_page_scope_id = EXCLUDED.recipient_page_scope_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.recipient_page_scope_id)
        .bind(conversation.ai_mode)
        .bind(&conversation.created_at)
        .bind(&conversation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_messages
                (id, conversation_id, content, sender, source, sent_by_ai, date, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.content)
        .bind(&message.sender)
        .bind(&message.source)
        .bind(message.sent_by_ai)
        .bind(&message.date)
        .bind(&message.created_at)
        .bind(&message.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, recipient_page_scope_id, ai_mode, created_at, updated_at \
             FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(conversation_from_row))
    }

    async fn conversation_for_recipient(
        &self,
        user_id: &str,
        recipient_page_scope_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, recipient_page_scope_id, ai_mode, created_at, updated_at \
             FROM conversations \
             WHERE user_id = $1 AND recipient_page_scope_id = $2 \
             ORDER BY updated_at DESC \
             LIMIT 1",
        )
        .bind(user_id)
        .bind(recipient_page_scope_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(conversation_from_row))
    }

    async fn conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, recipient_page_scope_id, ai_mode, created_at, updated_at \
             FROM conversations WHERE user_id = $1 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(conversation_from_row).collect())
    }

    async fn set_ai_mode(&self, conversation_id: &str, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE conversations SET ai_mode = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(enabled)
        .bind(crate::types::now_iso())
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(updated_at)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, content, sender, source, sent_by_ai, date, created_at, updated_at \
             FROM conversation_messages WHERE conversation_id = $1 ORDER BY date ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, content, sender, source, sent_by_ai, date, created_at, updated_at \
             FROM conversation_messages WHERE conversation_id = $1 ORDER BY date DESC LIMIT $2",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    async fn channel_by_page_name(
        &self,
        page_name: &str,
    ) -> Result<Option<ChannelCredentials>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, facebook_page_id, facebook_access_token, fb_page_name \
             FROM channels WHERE fb_page_name = $1 LIMIT 1",
        )
        .bind(page_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ChannelCredentials {
            user_id: row.get("user_id"),
            facebook_page_id: row.get("facebook_page_id"),
            facebook_access_token: row.get("facebook_access_token"),
            fb_page_name: row.get("fb_page_name"),
        }))
    }

    async fn persona_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<AssistantPersona>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, assistant_name, intro, short_description, guidelines \
             FROM assistant_personas WHERE user_id = $1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| AssistantPersona {
            user_id: row.get("user_id"),
            assistant_name: row.get("assistant_name"),
            intro: row.get("intro"),
            short_description: row.get("short_description"),
            guidelines: row.get("guidelines"),
        }))
    }
}
