use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::app::AppState;
use crate::errors::StoreError;
use crate::graph::GraphClient;
use crate::store::ChatStore;
use crate::types::{
    now_iso, AssistantPersona, ChannelCredentials, Conversation, ConversationMessage,
    MESSAGE_SOURCE_FACEBOOK,
};

/// In-memory `ChatStore` for tests, with per-record failure injection and
/// attempt counters so retry behavior is observable.
#[derive(Default)]
pub struct MemoryStore {
    pub conversations: Mutex<HashMap<String, Conversation>>,
    pub messages: Mutex<Vec<ConversationMessage>>,
    pub channels: Mutex<Vec<ChannelCredentials>>,
    pub personas: Mutex<HashMap<String, AssistantPersona>>,
    pub conversation_upsert_attempts: Mutex<HashMap<String, u32>>,
    pub message_upsert_attempts: Mutex<HashMap<String, u32>>,
    failing_conversation_ids: Mutex<HashSet<String>>,
    failing_message_ids: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn fail_conversation(&self, id: &str) {
        self.failing_conversation_ids
            .lock()
            .unwrap()
            .insert(id.to_string());
    }

    pub fn fail_message(&self, id: &str) {
        self.failing_message_ids
            .lock()
            .unwrap()
            .insert(id.to_string());
    }

    pub fn seed_channel(
        &self,
        user_id: &str,
        facebook_page_id: &str,
        facebook_access_token: &str,
        fb_page_name: &str,
    ) {
        self.channels.lock().unwrap().push(ChannelCredentials {
            user_id: user_id.to_string(),
            facebook_page_id: facebook_page_id.to_string(),
            facebook_access_token: facebook_access_token.to_string(),
            fb_page_name: fb_page_name.to_string(),
        });
    }

    pub fn seed_conversation(
        &self,
        id: &str,
        user_id: &str,
        recipient_page_scope_id: Option<&str>,
        ai_mode: bool,
    ) {
        let now = now_iso();
        self.conversations.lock().unwrap().insert(
            id.to_string(),
            Conversation {
                id: id.to_string(),
                user_id: user_id.to_string(),
                recipient_page_scope_id: recipient_page_scope_id.map(str::to_string),
                ai_mode,
                created_at: now.clone(),
                updated_at: now,
            },
        );
    }

    pub fn seed_message(
        &self,
        conversation_id: &str,
        content: &str,
        sender: &str,
        sent_by_ai: bool,
        minute_offset: i64,
    ) {
        let date = format!("2026-01-01T00:{minute_offset:02}:00+00:00");
        self.messages.lock().unwrap().push(ConversationMessage {
            id: format!("seed-{conversation_id}-{minute_offset}"),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            sender: sender.to_string(),
            source: MESSAGE_SOURCE_FACEBOOK.to_string(),
            sent_by_ai,
            date,
            created_at: now_iso(),
            updated_at: now_iso(),
        });
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        *self
            .conversation_upsert_attempts
            .lock()
            .unwrap()
            .entry(conversation.id.clone())
            .or_insert(0) += 1;
        if self
            .failing_conversation_ids
            .lock()
            .unwrap()
            .contains(&conversation.id)
        {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let mut conversations = self.conversations.lock().unwrap();
        match conversations.get_mut(&conversation.id) {
            // Mirrors the conflict clause: ai_mode and created_at survive.
            Some(existing) => {
                existing.user_id = conversation.user_id.clone();
                existing.recipient_page_scope_id = conversation.recipient_page_scope_id.clone();
                existing.updated_at = conversation.updated_at.clone();
            }
            None => {
                conversations.insert(conversation.id.clone(), conversation.clone());
            }
        }
        Ok(())
    }

    async fn upsert_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        *self
            .message_upsert_attempts
            .lock()
            .unwrap()
            .entry(message.id.clone())
            .or_insert(0) += 1;
        if self
            .failing_message_ids
            .lock()
            .unwrap()
            .contains(&message.id)
        {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let mut messages = self.messages.lock().unwrap();
        if messages.iter().all(|existing| existing.id != message.id) {
            messages.push(message.clone());
        }
        Ok(())
    }

    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.lock().unwrap().get(id).cloned())
    }

    async fn conversation_for_recipient(
        &self,
        user_id: &str,
        recipient_page_scope_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .values()
            .find(|conversation| {
                conversation.user_id == user_id
                    && conversation.recipient_page_scope_id.as_deref()
                        == Some(recipient_page_scope_id)
            })
            .cloned())
    }

    async fn conversations_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let mut list: Vec<Conversation> = self
            .conversations
            .lock()
            .unwrap()
            .values()
            .filter(|conversation| conversation.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn set_ai_mode(&self, conversation_id: &str, enabled: bool) -> Result<bool, StoreError> {
        let mut conversations = self.conversations.lock().unwrap();
        match conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.ai_mode = enabled;
                conversation.updated_at = now_iso();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        updated_at: &str,
    ) -> Result<(), StoreError> {
        if let Some(conversation) = self.conversations.lock().unwrap().get_mut(conversation_id) {
            conversation.updated_at = updated_at.to_string();
        }
        Ok(())
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let mut list: Vec<ConversationMessage> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(list)
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let mut list = self.messages_for_conversation(conversation_id).await?;
        list.reverse();
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn channel_by_page_name(
        &self,
        page_name: &str,
    ) -> Result<Option<ChannelCredentials>, StoreError> {
        Ok(self
            .channels
            .lock()
            .unwrap()
            .iter()
            .find(|channel| channel.fb_page_name == page_name)
            .cloned())
    }

    async fn persona_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<AssistantPersona>, StoreError> {
        Ok(self.personas.lock().unwrap().get(user_id).cloned())
    }
}

/// App state wired for tests: in-memory store, and every remote base URL
/// pointed at the caller's mock server.
pub fn test_state(server_url: &str, store: Arc<MemoryStore>) -> AppState {
    let http = reqwest::Client::new();
    AppState {
        store,
        graph: GraphClient::new(http.clone(), server_url),
        http,
        openai_base_url: server_url.to_string(),
        verify_token: "verify-secret".to_string(),
        app_token: "app-token".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_come_back_in_chronological_order() {
        let store = MemoryStore::default();
        store.seed_conversation("t_1", "tenant-1", Some("psid-1"), true);
        store.seed_message("t_1", "third", "Jane", false, 2);
        store.seed_message("t_1", "first", "Jane", false, 0);
        store.seed_message("t_1", "second", "Jane", false, 1);

        let ordered = store.messages_for_conversation("t_1").await.unwrap();
        let contents: Vec<&str> = ordered.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);

        let recent = store.recent_messages("t_1", 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["third", "second"]);
    }

    #[tokio::test]
    async fn upsert_message_ignores_duplicate_ids() {
        let store = MemoryStore::default();
        store.seed_conversation("t_1", "tenant-1", Some("psid-1"), true);
        let message = ConversationMessage {
            id: "fixed-id".to_string(),
            conversation_id: "t_1".to_string(),
            content: "first write".to_string(),
            sender: "Jane".to_string(),
            source: MESSAGE_SOURCE_FACEBOOK.to_string(),
            sent_by_ai: false,
            date: now_iso(),
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        store.upsert_message(&message).await.unwrap();
        let mut replay = message.clone();
        replay.content = "changed".to_string();
        store.upsert_message(&replay).await.unwrap();

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "first write");
    }

    #[tokio::test]
    async fn conversation_upsert_preserves_ai_mode() {
        let store = MemoryStore::default();
        store.seed_conversation("t_1", "tenant-1", Some("psid-1"), false);
        let incoming = Conversation {
            id: "t_1".to_string(),
            user_id: "tenant-1".to_string(),
            recipient_page_scope_id: Some("psid-1".to_string()),
            ai_mode: true,
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        store.upsert_conversation(&incoming).await.unwrap();
        assert!(!store.conversations.lock().unwrap()["t_1"].ai_mode);
    }
}
