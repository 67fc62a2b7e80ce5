use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::{GraphError, GraphErrorKind};

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v21.0";

/// Thin client over the platform's Graph API. The base URL lives in state
/// so tests can point it at a local server.
#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn conversations_url(&self, page_id: &str, access_token: &str) -> String {
        format!(
            "{}/{}/conversations?fields=participants&limit=100&access_token={}",
            self.base_url, page_id, access_token
        )
    }

    pub fn thread_messages_url(&self, thread_id: &str, access_token: &str) -> String {
        format!(
            "{}/{}/messages?fields=message,created_time,from&limit=100&access_token={}",
            self.base_url, thread_id, access_token
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value, GraphError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GraphError::generic(format!("graph request failed: {err}")))?;
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            return Err(classify_graph_error(status, &body));
        }
        Ok(body)
    }

    /// Follows `paging.next` cursors from `start_url` until none remains
    /// and returns the concatenated `data` arrays in page order. The whole
    /// collection is buffered before returning; a failed page fetch aborts
    /// the walk and propagates.
    pub async fn fetch_all_pages(&self, start_url: &str) -> Result<Vec<Value>, GraphError> {
        let mut items = Vec::new();
        let mut next_url = Some(start_url.to_string());
        while let Some(url) = next_url {
            let payload = self.get_json(&url).await?;
            if let Some(data) = payload.get("data").and_then(Value::as_array) {
                items.extend(data.iter().cloned());
            }
            next_url = payload
                .get("paging")
                .and_then(|paging| paging.get("next"))
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(items)
    }

    /// Display name of a page, looked up with the app-level token.
    pub async fn page_name(&self, page_id: &str, access_token: &str) -> Result<String, GraphError> {
        let url = format!(
            "{}/{}?fields=name&access_token={}",
            self.base_url, page_id, access_token
        );
        let payload = self.get_json(&url).await?;
        payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GraphError::generic(format!("page {page_id} lookup returned no name")))
    }

    /// The thread id of the page's conversation with one end-user.
    pub async fn thread_for_user(
        &self,
        page_id: &str,
        user_psid: &str,
        access_token: &str,
    ) -> Result<String, GraphError> {
        let url = format!(
            "{}/{}/conversations?user_id={}&access_token={}",
            self.base_url, page_id, user_psid, access_token
        );
        let payload = self.get_json(&url).await?;
        payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.first())
            .and_then(|thread| thread.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                GraphError::session_no_id(format!("no conversation thread for user {user_psid}"))
            })
    }

    /// First/last name of an end-user; missing parts come back empty.
    pub async fn user_profile(
        &self,
        user_psid: &str,
        access_token: &str,
    ) -> Result<(String, String), GraphError> {
        let url = format!(
            "{}/{}?fields=first_name,last_name&access_token={}",
            self.base_url, user_psid, access_token
        );
        let payload = self.get_json(&url).await?;
        let first = payload
            .get("first_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let last = payload
            .get("last_name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok((first, last))
    }

    /// Delivers one text message to a recipient. Fire-and-forget: a failed
    /// send is logged and reported as `false`, never raised.
    pub async fn send_message(
        &self,
        recipient_psid: &str,
        text: &str,
        access_token: &str,
    ) -> bool {
        let url = format!("{}/me/messages?access_token={}", self.base_url, access_token);
        let payload = json!({
            "recipient": { "id": recipient_psid },
            "messaging_type": "RESPONSE",
            "message": { "text": text }
        });
        let response = match self.http.post(&url).json(&payload).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("outbound send request failed: {err}");
                return false;
            }
        };
        let status = response.status();
        if status.is_success() {
            return true;
        }
        let body = response.text().await.unwrap_or_default();
        warn!("outbound send returned {status}: {body}");
        false
    }
}

fn classify_graph_error(status: StatusCode, body: &Value) -> GraphError {
    let error = body.get("error");
    let message = error
        .and_then(|err| err.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("graph api returned {status}"));
    let code = error.and_then(|err| err.get("code")).and_then(Value::as_i64);
    let error_type = error
        .and_then(|err| err.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");

    let kind = match code {
        Some(190) => GraphErrorKind::Session,
        Some(102) => GraphErrorKind::SessionNoId,
        _ if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || error_type == "OAuthException" =>
        {
            GraphErrorKind::Auth
        }
        _ => GraphErrorKind::Generic,
    };
    GraphError::new(kind, message)
}
