use chrono::{DateTime, NaiveDateTime, Utc};
use ragline_protocol::Citation;
use serde::{Deserialize, Deserializer, Serialize};

use super::error::{ApiResult, InvalidInputSnafu};
use super::ids::{KnowledgeId, MessageId, SessionId, UserId};

/// Title the server gives a session nobody has named yet.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
/// Every placeholder title the server is known to assign before auto-titling.
pub const PLACEHOLDER_SESSION_TITLES: &[&str] = &[DEFAULT_SESSION_TITLE, "新对话"];
pub const DEFAULT_SESSION_ICON: &str = "message-square";
pub const DEFAULT_TOP_K: u32 = 5;
pub const MAX_TOP_K: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    pub knowledge_id: KnowledgeId,
    #[serde(default)]
    pub knowledge_ids: Vec<KnowledgeId>,
    pub user_id: UserId,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Knowledge sources searched for this session; falls back to the primary one.
    pub fn knowledge_sources(&self) -> Vec<KnowledgeId> {
        if self.knowledge_ids.is_empty() {
            vec![self.knowledge_id]
        } else {
            self.knowledge_ids.clone()
        }
    }

    /// True while the server has not replaced its placeholder title yet.
    pub fn has_placeholder_title(&self) -> bool {
        is_placeholder_title(&self.title)
    }

    /// Shallow field-by-field merge; absent patch fields leave the record untouched.
    pub fn merge_patch(&mut self, patch: &SessionPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(icon) = &patch.icon {
            self.icon = icon.clone();
        }
        if let Some(top_k) = patch.top_k {
            self.top_k = top_k;
        }
        if let Some(knowledge_ids) = &patch.knowledge_ids {
            self.knowledge_ids = knowledge_ids.clone();
        }
    }
}

pub fn is_placeholder_title(title: &str) -> bool {
    let title = title.trim();
    title.is_empty() || PLACEHOLDER_SESSION_TITLES.contains(&title)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSession {
    pub knowledge_id: KnowledgeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl NewSession {
    /// Session searching one knowledge source, titled and styled by the server.
    pub fn new(knowledge_id: KnowledgeId) -> Self {
        Self {
            knowledge_id,
            title: None,
            icon: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// Partial update; only `Some` fields are sent and merged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_ids: Option<Vec<KnowledgeId>>,
}

impl SessionPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.icon.is_none()
            && self.top_k.is_none()
            && self.knowledge_ids.is_none()
    }

    pub fn validate(&self) -> ApiResult<()> {
        if let Some(top_k) = self.top_k {
            validate_top_k(top_k)?;
        }

        if let Some(knowledge_ids) = &self.knowledge_ids
            && knowledge_ids.is_empty()
        {
            return InvalidInputSnafu {
                stage: "validate-session-patch",
                details: "a session needs at least one knowledge source".to_string(),
            }
            .fail();
        }

        Ok(())
    }
}

pub fn validate_top_k(top_k: u32) -> ApiResult<()> {
    if (1..=MAX_TOP_K).contains(&top_k) {
        return Ok(());
    }

    InvalidInputSnafu {
        stage: "validate-top-k",
        details: format!("top_k must be between 1 and {MAX_TOP_K}, got {top_k}"),
    }
    .fail()
}

/// One persisted message of a session's history.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Citation>,
    #[serde(default)]
    pub token_usage: f64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Body of the completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_model_name: Option<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_name: Option<String>,
}

impl CompletionRequest {
    /// Streaming request with server-side defaults for every option.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: None,
            llm_model: None,
            rerank_model_name: None,
            stream: true,
            prompt_name: None,
        }
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_llm_model(mut self, llm_model: impl Into<String>) -> Self {
        self.llm_model = Some(llm_model.into());
        self
    }

    pub fn with_rerank_model(mut self, rerank_model_name: impl Into<String>) -> Self {
        self.rerank_model_name = Some(rerank_model_name.into());
        self
    }

    pub fn with_prompt_name(mut self, prompt_name: impl Into<String>) -> Self {
        self.prompt_name = Some(prompt_name.into());
        self
    }
}

/// Body of a successful login; any other fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

fn default_icon() -> String {
    DEFAULT_SESSION_ICON.to_string()
}

fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}

// The backend emits naive local timestamps; treat offset-less values as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("unrecognized timestamp '{raw}'"))
    })
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
