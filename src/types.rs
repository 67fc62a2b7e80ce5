use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A persisted thread between a tenant's Facebook page and one external
/// end-user. `id` is the platform-assigned thread id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub recipient_page_scope_id: Option<String>,
    pub ai_mode: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A single utterance within a conversation. `date` is the
/// platform-reported event time and drives chronological ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub sender: String,
    pub source: String,
    pub sent_by_ai: bool,
    pub date: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Per-tenant Messenger channel credentials. Read-only in this service;
/// provisioned by the channel-setup surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCredentials {
    pub user_id: String,
    pub facebook_page_id: String,
    pub facebook_access_token: String,
    pub fb_page_name: String,
}

/// Per-tenant assistant persona used to build the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantPersona {
    pub user_id: String,
    pub assistant_name: String,
    pub intro: String,
    pub short_description: String,
    pub guidelines: String,
}

impl AssistantPersona {
    pub fn fallback(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            assistant_name: String::new(),
            intro: String::new(),
            short_description: String::new(),
            guidelines: String::new(),
        }
    }
}

/// One turn of the chat-completion prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestBody {
    #[serde(default)]
    pub facebook_page_id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub recipient_page_scope_id: String,
    #[serde(default)]
    pub facebook_access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiModeBody {
    pub ai_mode: bool,
}

pub const MESSAGE_SOURCE_FACEBOOK: &str = "Facebook";

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

/// Stable message id for records that originate on the platform. Replayed
/// deliveries of the same remote message hash to the same id, so the
/// insert's conflict clause absorbs them.
pub fn stable_message_id(conversation_id: &str, remote_mid: &str) -> String {
    sha256_hex(&format!("{conversation_id}:{remote_mid}"))
}
