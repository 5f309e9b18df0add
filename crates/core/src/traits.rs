use crate::error::{CompletionError, EmbeddingError, StoreError};
use crate::models::{
    Agent, AgentId, Chat, ChatId, ChatMessage, Chunk, Document, DocumentId, IngestionStatus,
    NewChunk, NewDocument, NewMessage, PromptMessage, ScopedChunk,
};
use async_trait::async_trait;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the bytes and returns the path they can be fetched back from.
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError>;

    async fn download(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    fn public_url(&self, path: &str) -> String;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>, StoreError>;

    async fn child_agents(&self, parent_id: AgentId) -> Result<Vec<Agent>, StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, document: NewDocument) -> Result<Document, StoreError>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    async fn documents_for_agents(&self, agent_ids: &[AgentId])
        -> Result<Vec<Document>, StoreError>;

    async fn set_extracted_text(&self, id: DocumentId, text: &str) -> Result<(), StoreError>;

    async fn set_status(&self, id: DocumentId, status: IngestionStatus) -> Result<(), StoreError>;

    async fn delete_document(&self, id: DocumentId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn insert_chunk(&self, chunk: NewChunk) -> Result<Chunk, StoreError>;

    /// Every chunk owned by one of `agent_ids`, joined with its document's file name.
    async fn chunks_for_agents(&self, agent_ids: &[AgentId])
        -> Result<Vec<ScopedChunk>, StoreError>;

    async fn count_chunks(&self, document_id: DocumentId) -> Result<usize, StoreError>;

    async fn delete_chunks_for_document(&self, document_id: DocumentId)
        -> Result<usize, StoreError>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_chat(&self, id: ChatId) -> Result<Option<Chat>, StoreError>;

    /// Messages of one chat, oldest first.
    async fn messages(&self, chat_id: ChatId) -> Result<Vec<ChatMessage>, StoreError>;

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;
}

/// The relational side of the system: agents, documents, chunks and chats.
pub trait RelationalStore: AgentStore + DocumentStore + ChunkStore + ChatStore {}

impl<T> RelationalStore for T where T: AgentStore + DocumentStore + ChunkStore + ChatStore {}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, CompletionError>;
}
