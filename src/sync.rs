use std::time::Duration;

use futures_util::future::{join_all, try_join_all};
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::SyncError;
use crate::graph::GraphClient;
use crate::store::{self, ChatStore, UPSERT_RETRIES, UPSERT_RETRY_DELAY};
use crate::types::{
    now_iso, stable_message_id, Conversation, ConversationMessage, MESSAGE_SOURCE_FACEBOOK,
};

pub const SYNC_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub chunk_size: usize,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            chunk_size: SYNC_CHUNK_SIZE,
            retries: UPSERT_RETRIES,
            retry_delay: UPSERT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteConversation {
    id: String,
    recipient_page_scope_id: Option<String>,
}

/// Bulk reconciliation of one page's remote conversation state into local
/// storage. Phase 1 upserts conversation rows; messages backfill only after
/// every conversation row landed, since messages foreign-key into them.
/// Succeeds all-or-error at the job level.
pub async fn run_conversation_sync(
    store: &dyn ChatStore,
    graph: &GraphClient,
    page_id: &str,
    access_token: &str,
    user_id: &str,
    options: &SyncOptions,
) -> Result<(), SyncError> {
    let raw_conversations = graph
        .fetch_all_pages(&graph.conversations_url(page_id, access_token))
        .await?;

    let remotes: Vec<RemoteConversation> = raw_conversations
        .iter()
        .filter_map(|raw| {
            let id = raw.get("id").and_then(Value::as_str)?.to_string();
            Some(RemoteConversation {
                id,
                recipient_page_scope_id: derive_recipient(raw, page_id),
            })
        })
        .collect();
    info!(
        total = remotes.len(),
        "discovered remote conversations for page {page_id}"
    );

    // Phase 1: conversation rows, sequential chunks, fan-out within a
    // chunk. One exhausted retry fails the whole chunk and the job.
    for chunk in remotes.chunks(options.chunk_size) {
        try_join_all(chunk.iter().map(|remote| {
            let conversation = conversation_record(remote, user_id);
            async move {
                store::retry_upsert_conversation(
                    store,
                    &conversation,
                    options.retries,
                    options.retry_delay,
                )
                .await
            }
        }))
        .await?;
    }

    // Phase 2: message backfill, same chunking. A conversation whose
    // history fetch fails aborts the chunk; a single message that exhausts
    // its retries is logged and skipped.
    for chunk in remotes.chunks(options.chunk_size) {
        try_join_all(
            chunk
                .iter()
                .map(|remote| backfill_conversation_messages(store, graph, remote, access_token, options)),
        )
        .await?;
    }

    Ok(())
}

async fn backfill_conversation_messages(
    store: &dyn ChatStore,
    graph: &GraphClient,
    remote: &RemoteConversation,
    access_token: &str,
    options: &SyncOptions,
) -> Result<(), SyncError> {
    let raw_messages = graph
        .fetch_all_pages(&graph.thread_messages_url(&remote.id, access_token))
        .await?;
    let records: Vec<ConversationMessage> = raw_messages
        .iter()
        .filter_map(|raw| message_record(raw, &remote.id))
        .collect();

    let results = join_all(records.iter().map(|message| async move {
        store::retry_upsert_message(store, message, options.retries, options.retry_delay)
            .await
            .map_err(|err| (message.id.clone(), err))
    }))
    .await;
    for (message_id, err) in results.into_iter().filter_map(Result::err) {
        warn!(
            conversation_id = %remote.id,
            message_id = %message_id,
            "message upsert failed after retries: {err}"
        );
    }
    Ok(())
}

/// The external end of a conversation is the participant whose id differs
/// from the page's own id; a conversation with no such participant has no
/// recipient.
fn derive_recipient(raw: &Value, page_id: &str) -> Option<String> {
    raw.get("participants")
        .and_then(|participants| participants.get("data"))
        .and_then(Value::as_array)
        .and_then(|data| {
            data.iter().find_map(|participant| {
                let id = participant.get("id").and_then(Value::as_str)?;
                (id != page_id).then(|| id.to_string())
            })
        })
}

fn conversation_record(remote: &RemoteConversation, user_id: &str) -> Conversation {
    let now = now_iso();
    Conversation {
        id: remote.id.clone(),
        user_id: user_id.to_string(),
        recipient_page_scope_id: remote.recipient_page_scope_id.clone(),
        ai_mode: true,
        created_at: now.clone(),
        updated_at: now,
    }
}

fn message_record(raw: &Value, conversation_id: &str) -> Option<ConversationMessage> {
    let remote_mid = raw.get("id").and_then(Value::as_str)?;
    let content = raw
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let sender = raw
        .get("from")
        .and_then(|from| from.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let now = now_iso();
    let date = raw
        .get("created_time")
        .and_then(Value::as_str)
        .unwrap_or(&now)
        .to_string();
    Some(ConversationMessage {
        id: stable_message_id(conversation_id, remote_mid),
        conversation_id: conversation_id.to_string(),
        content,
        sender,
        source: MESSAGE_SOURCE_FACEBOOK.to_string(),
        sent_by_ai: false,
        date,
        created_at: now.clone(),
        updated_at: now,
    })
}
