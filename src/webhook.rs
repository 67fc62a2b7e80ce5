use std::collections::HashMap;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::errors::WebhookError;
use crate::prompting::{self, HISTORY_WINDOW};
use crate::types::{
    now_iso, stable_message_id, AssistantPersona, Conversation, ConversationMessage,
    MESSAGE_SOURCE_FACEBOOK,
};

/// Outcome of the subscription handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified(String),
    Forbidden,
    BadRequest,
}

pub fn verify_subscription(
    params: &HashMap<String, String>,
    expected_token: &str,
) -> VerificationOutcome {
    let mode = params.get("hub.mode");
    let token = params.get("hub.verify_token");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    match (mode, token) {
        (Some(mode), Some(token)) => {
            if mode == "subscribe" && token == expected_token {
                VerificationOutcome::Verified(challenge)
            } else {
                VerificationOutcome::Forbidden
            }
        }
        _ => VerificationOutcome::BadRequest,
    }
}

/// The one event this service processes per delivery. The platform can
/// batch several entries and messaging events into a payload; only
/// `entry[0].messaging[0]` is handled, matching the subscription setup.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub sender_id: String,
    pub recipient_page_id: String,
    pub message_text: String,
    pub remote_mid: Option<String>,
    pub event_time: String,
}

pub fn parse_delivery(payload: &Value) -> Result<InboundEvent, WebhookError> {
    let messaging = payload
        .get("entry")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("messaging"))
        .and_then(Value::as_array)
        .and_then(|events| events.first())
        .ok_or_else(|| WebhookError::Validation("no messaging event in payload".to_string()))?;

    let sender_id = messaging
        .get("sender")
        .and_then(|sender| sender.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WebhookError::Validation("missing sender id".to_string()))?;
    let recipient_page_id = messaging
        .get("recipient")
        .and_then(|recipient| recipient.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WebhookError::Validation("missing recipient id".to_string()))?;
    let message_text = messaging
        .get("message")
        .and_then(|message| message.get("text"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| WebhookError::Validation("missing message text".to_string()))?;
    let remote_mid = messaging
        .get("message")
        .and_then(|message| message.get("mid"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let event_time = messaging
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|timestamp| timestamp.to_rfc3339())
        .unwrap_or_else(now_iso);

    Ok(InboundEvent {
        sender_id: sender_id.to_string(),
        recipient_page_id: recipient_page_id.to_string(),
        message_text: message_text.to_string(),
        remote_mid,
        event_time,
    })
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Inbound message stored; the conversation has AI replies disabled.
    Received(ConversationMessage),
    /// Inbound message stored, AI reply generated, stored, and dispatched.
    Replied(ConversationMessage),
}

/// The full delivery transition. Steps run sequentially; the first failure
/// aborts the request and nothing already written is rolled back, so an
/// inbound message can outlive a failed reply.
pub async fn process_delivery(
    state: &AppState,
    payload: &Value,
) -> Result<DeliveryOutcome, WebhookError> {
    let event = parse_delivery(payload)?;

    let page_name = state
        .graph
        .page_name(&event.recipient_page_id, &state.app_token)
        .await?;

    // Tenant resolution joins on the human-readable page name, as the
    // channel-setup surface stores it. A page rename breaks this join.
    let channel = state
        .store
        .channel_by_page_name(&page_name)
        .await?
        .ok_or_else(|| {
            WebhookError::UpstreamLookup(format!("no channel configured for page \"{page_name}\""))
        })?;

    let thread_id = state
        .graph
        .thread_for_user(
            &channel.facebook_page_id,
            &event.sender_id,
            &channel.facebook_access_token,
        )
        .await?;

    let (first_name, last_name) = state
        .graph
        .user_profile(&event.sender_id, &channel.facebook_access_token)
        .await?;
    let sender_name = format!("{first_name} {last_name}").trim().to_string();

    let now = now_iso();
    let conversation = match state
        .store
        .conversation_for_recipient(&channel.user_id, &event.sender_id)
        .await?
    {
        Some(existing) => {
            state.store.touch_conversation(&existing.id, &now).await?;
            existing
        }
        None => {
            let created = Conversation {
                id: thread_id,
                user_id: channel.user_id.clone(),
                recipient_page_scope_id: Some(event.sender_id.clone()),
                ai_mode: true,
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            state.store.upsert_conversation(&created).await?;
            created
        }
    };

    let inbound = ConversationMessage {
        id: event
            .remote_mid
            .as_deref()
            .map(|mid| stable_message_id(&conversation.id, mid))
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        conversation_id: conversation.id.clone(),
        content: event.message_text.clone(),
        sender: sender_name,
        source: MESSAGE_SOURCE_FACEBOOK.to_string(),
        sent_by_ai: false,
        date: event.event_time.clone(),
        created_at: now.clone(),
        updated_at: now.clone(),
    };
    state.store.upsert_message(&inbound).await?;

    if !conversation.ai_mode {
        info!(
            conversation_id = %conversation.id,
            "ai mode disabled, stored inbound message only"
        );
        return Ok(DeliveryOutcome::Received(inbound));
    }

    let persona = state
        .store
        .persona_for_user(&channel.user_id)
        .await?
        .unwrap_or_else(|| AssistantPersona::fallback(&channel.user_id));
    let mut history = state
        .store
        .recent_messages(&conversation.id, HISTORY_WINDOW)
        .await?;
    history.reverse();
    let turns = prompting::build_reply_prompt(&persona, &channel.fb_page_name, &history);

    let reply_text =
        prompting::generate_reply(&state.http, &state.openai_base_url, &turns).await?;

    let reply_time = now_iso();
    let reply = ConversationMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        content: reply_text.clone(),
        sender: channel.fb_page_name.clone(),
        source: MESSAGE_SOURCE_FACEBOOK.to_string(),
        sent_by_ai: true,
        date: reply_time.clone(),
        created_at: reply_time.clone(),
        updated_at: reply_time.clone(),
    };
    state.store.upsert_message(&reply).await?;
    state
        .store
        .touch_conversation(&conversation.id, &reply_time)
        .await?;

    // Fire-and-forget: a failed dispatch is logged inside the client and
    // does not fail the request.
    state
        .graph
        .send_message(
            &event.sender_id,
            &reply_text,
            &channel.facebook_access_token,
        )
        .await;

    Ok(DeliveryOutcome::Replied(reply))
}
