use minijinja::{context, Environment};
use serde_json::{json, Value};

use crate::errors::ProviderError;
use crate::types::{AssistantPersona, ChatTurn, ConversationMessage};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// How many stored messages feed the reply prompt, newest first.
pub const HISTORY_WINDOW: i64 = 10;

pub struct SystemPromptContext<'a> {
    pub assistant_name: &'a str,
    pub intro: &'a str,
    pub short_description: &'a str,
    pub guidelines: &'a str,
    pub page_name: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            assistant_name => ctx.assistant_name,
            intro => ctx.intro,
            short_description => ctx.short_description,
            guidelines => ctx.guidelines,
            page_name => ctx.page_name,
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are {}, replying to customers of the Facebook page \"{}\".\n\
         Answer the latest customer message using the conversation so far.\n\
         Keep replies short, helpful, and friendly. Never invent facts.\n",
        if ctx.assistant_name.trim().is_empty() {
            "a support assistant"
        } else {
            ctx.assistant_name.trim()
        },
        if ctx.page_name.trim().is_empty() {
            "the page"
        } else {
            ctx.page_name.trim()
        }
    );

    if !ctx.intro.trim().is_empty() {
        prompt.push_str("\nIntroduction:\n");
        prompt.push_str(ctx.intro.trim());
        prompt.push('\n');
    }

    if !ctx.short_description.trim().is_empty() {
        prompt.push_str("\nAbout the business:\n");
        prompt.push_str(ctx.short_description.trim());
        prompt.push('\n');
    }

    if !ctx.guidelines.trim().is_empty() {
        prompt.push_str("\nGuidelines:\n");
        prompt.push_str(ctx.guidelines.trim());
        prompt.push('\n');
    }

    prompt
}

/// Maps stored messages onto chat roles: utterances from the page itself
/// count as "assistant", everything else as "user". `messages` must be in
/// ascending `date` order.
pub fn build_chat_history(messages: &[ConversationMessage], page_name: &str) -> Vec<ChatTurn> {
    messages
        .iter()
        .map(|message| {
            let from_page = message.sent_by_ai || message.sender == page_name;
            ChatTurn::new(
                if from_page { "assistant" } else { "user" },
                message.content.clone(),
            )
        })
        .collect()
}

/// Full prompt for one reply: a single persona system message followed by
/// the history window in chronological order (the inbound message that
/// triggered the reply is the last entry).
pub fn build_reply_prompt(
    persona: &AssistantPersona,
    page_name: &str,
    history: &[ConversationMessage],
) -> Vec<ChatTurn> {
    let system = render_system_prompt(&SystemPromptContext {
        assistant_name: &persona.assistant_name,
        intro: &persona.intro,
        short_description: &persona.short_description,
        guidelines: &persona.guidelines,
        page_name,
    });
    let mut turns = Vec::with_capacity(history.len() + 1);
    turns.push(ChatTurn::new("system", system));
    turns.extend(build_chat_history(history, page_name));
    turns
}

/// Sends the prompt to the chat-completion provider and returns the first
/// choice's content. Non-success status and empty content both fail; the
/// caller does not retry.
pub async fn generate_reply(
    http: &reqwest::Client,
    base_url: &str,
    turns: &[ChatTurn],
) -> Result<String, ProviderError> {
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.trim().is_empty() {
        return Err(ProviderError::Request("OPENAI_API_KEY not configured".to_string()));
    }
    let model =
        std::env::var("OPENAI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4.1".to_string());
    let response = http
        .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
        .bearer_auth(api_key)
        .json(&json!({
            "model": model,
            "messages": turns,
            "temperature": 0.7
        }))
        .send()
        .await
        .map_err(|err| ProviderError::Request(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| ProviderError::Request(format!("response parse failed: {err}")))?;
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return Err(ProviderError::EmptyContent);
    }
    Ok(text)
}
