use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type AgentId = i64;
pub type DocumentId = i64;
pub type ChunkId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub is_parent: bool,
    #[serde(default)]
    pub parent_id: Option<AgentId>,
}

impl Agent {
    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Whether a document's chunks are available to retrieval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    pub agent_id: AgentId,
    pub file_name: String,
    pub file_type: String,
    #[serde(default)]
    pub storage_path: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub file_size: usize,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub status: IngestionStatus,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn is_ready(&self) -> bool {
        self.status == IngestionStatus::Ready
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDocument {
    pub agent_id: AgentId,
    pub file_name: String,
    pub file_type: String,
    pub storage_path: String,
    pub file_url: String,
    pub file_size: usize,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub agent_id: AgentId,
    pub content: String,
    pub source: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChunk {
    pub document_id: DocumentId,
    pub agent_id: AgentId,
    pub content: String,
    pub source: String,
    pub embedding: Option<Vec<f32>>,
}

/// A candidate chunk joined with the file name of its document.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedChunk {
    pub chunk: Chunk,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScoringMode {
    Embedding,
    Keyword,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f64,
    pub source_document: String,
    pub mode: ScoringMode,
}

/// The agent ids whose chunks are eligible for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorpusScope {
    agents: BTreeSet<AgentId>,
}

impl CorpusScope {
    pub fn new(agent_id: AgentId) -> Self {
        let mut agents = BTreeSet::new();
        agents.insert(agent_id);
        Self { agents }
    }

    pub fn insert(&mut self, agent_id: AgentId) -> bool {
        self.agents.insert(agent_id)
    }

    pub fn contains(&self, agent_id: AgentId) -> bool {
        self.agents.contains(&agent_id)
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().copied().collect()
    }

}

impl<const N: usize> From<[AgentId; N]> for CorpusScope {
    fn from(value: [AgentId; N]) -> Self {
        Self {
            agents: value.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub agent_id: AgentId,
    pub query: String,
    pub limit: usize,
    pub include_parent_docs: bool,
    pub include_child_agent_context: bool,
}

impl RetrievalRequest {
    pub fn new(agent_id: AgentId, query: impl Into<String>) -> Self {
        Self {
            agent_id,
            query: query.into(),
            limit: DEFAULT_RETRIEVAL_LIMIT,
            include_parent_docs: false,
            include_child_agent_context: false,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_parent_docs(mut self, include: bool) -> Self {
        self.include_parent_docs = include;
        self
    }

    pub fn with_child_agents(mut self, include: bool) -> Self {
        self.include_child_agent_context = include;
        self
    }
}

pub const DEFAULT_RETRIEVAL_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    pub agent_id: AgentId,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
}

/// One turn handed to the completion model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}
