use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionStreamResponse,
};
use common::error::AppError;
use retrieval_pipeline::ChunkMatch;
use serde::Serialize;

use crate::{AnswerDebug, ProviderInfo};

/// SSE event envelope. Every stream terminates with `done` (or `error` when
/// the transport itself fails); deltas arrive as `text` fragments.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AnswerEvent {
    Text {
        content: String,
    },
    Done {
        #[serde(flatten)]
        payload: Box<DonePayload>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Serialize)]
pub struct DonePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub sources: Vec<ChunkMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_response_id: Option<String>,
    pub debug: AnswerDebug,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pull the text fragment out of one streaming response.
///
/// Providers behind the OpenAI-compatible surface differ: most send
/// incremental `delta.content`, some emit the whole message mid-stream as a
/// single delta, and some send empty keep-alive chunks. Empty fragments are
/// filtered so the SSE layer never emits blank `text` events.
pub fn extract_delta(response: &CreateChatCompletionStreamResponse) -> Option<String> {
    response
        .choices
        .first()
        .and_then(|choice| choice.delta.content.clone())
        .filter(|content| !content.is_empty())
}

/// Capture the provider response id when the stream carries one.
pub fn extract_response_id(response: &CreateChatCompletionStreamResponse) -> Option<String> {
    let id = response.id.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// One prior conversation turn, as carried by chat requests.
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// Assemble the request messages: system prompt, prior turns, then the user
/// message with the context block prepended.
pub fn build_messages(
    system_prompt: &str,
    history: &[HistoryTurn],
    context_text: &str,
    query: &str,
) -> Result<Vec<ChatCompletionRequestMessage>, AppError> {
    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(history.len() + 2);

    messages.push(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt)
            .build()?
            .into(),
    );

    for turn in history {
        let message: ChatCompletionRequestMessage = if turn.role.eq_ignore_ascii_case("assistant")
        {
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(turn.content.clone())
                .build()?
                .into()
        } else {
            ChatCompletionRequestUserMessageArgs::default()
                .content(turn.content.clone())
                .build()?
                .into()
        };
        messages.push(message);
    }

    let user_content = if context_text.is_empty() {
        query.to_string()
    } else {
        format!("{context_text}\n\nQuestion: {query}")
    };
    messages.push(
        ChatCompletionRequestUserMessageArgs::default()
            .content(user_content)
            .build()?
            .into(),
    );

    Ok(messages)
}
