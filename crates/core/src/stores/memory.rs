use crate::error::StoreError;
use crate::models::{
    Agent, AgentId, Chat, ChatId, ChatMessage, Chunk, ChunkId, Document, DocumentId,
    IngestionStatus, MessageId, NewChunk, NewDocument, NewMessage, ScopedChunk,
};
use crate::traits::{AgentStore, BlobStore, ChatStore, ChunkStore, DocumentStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Tables {
    agents: BTreeMap<AgentId, Agent>,
    documents: BTreeMap<DocumentId, Document>,
    chunks: BTreeMap<ChunkId, Chunk>,
    chats: BTreeMap<ChatId, Chat>,
    messages: BTreeMap<MessageId, ChatMessage>,
    blobs: HashMap<String, (Vec<u8>, String)>,
    next_id: i64,
    failing_chunk_inserts: usize,
    failing_agent_lookups: bool,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store for every collaborator trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_agent(&self, agent: Agent) -> Agent {
        let mut tables = self.tables();
        tables.next_id = tables.next_id.max(agent.id);
        tables.agents.insert(agent.id, agent.clone());
        agent
    }

    pub fn create_agent(
        &self,
        name: impl Into<String>,
        is_parent: bool,
        parent_id: Option<AgentId>,
    ) -> Agent {
        let id = self.tables().next_id();
        self.add_agent(Agent {
            id,
            name: name.into(),
            description: None,
            client_id: None,
            is_parent,
            parent_id,
        })
    }

    pub fn create_chat(&self, agent_id: AgentId, title: Option<String>) -> Chat {
        let mut tables = self.tables();
        let chat = Chat {
            id: tables.next_id(),
            agent_id,
            title,
        };
        tables.chats.insert(chat.id, chat.clone());
        chat
    }

    /// Makes the next `count` chunk inserts fail.
    pub fn fail_next_chunk_inserts(&self, count: usize) {
        self.tables().failing_chunk_inserts = count;
    }

    pub fn fail_agent_lookups(&self, failing: bool) {
        self.tables().failing_agent_lookups = failing;
    }

    pub fn blob_count(&self) -> usize {
        self.tables().blobs.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.tables().chunks.len()
    }
}

fn unavailable(details: &str) -> StoreError {
    StoreError::BackendResponse {
        backend: "memory".to_string(),
        details: details.to_string(),
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError> {
        self.tables()
            .blobs
            .insert(path.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.tables()
            .blobs
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::InvalidArgument(format!("no blob stored at {path}")))
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{path}")
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.tables().blobs.remove(path);
        Ok(())
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>, StoreError> {
        let tables = self.tables();
        if tables.failing_agent_lookups {
            return Err(unavailable("agent lookup failed"));
        }
        Ok(tables.agents.get(&id).cloned())
    }

    async fn child_agents(&self, parent_id: AgentId) -> Result<Vec<Agent>, StoreError> {
        let tables = self.tables();
        if tables.failing_agent_lookups {
            return Err(unavailable("agent lookup failed"));
        }
        Ok(tables
            .agents
            .values()
            .filter(|agent| agent.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, document: NewDocument) -> Result<Document, StoreError> {
        let mut tables = self.tables();
        let stored = Document {
            id: tables.next_id(),
            agent_id: document.agent_id,
            file_name: document.file_name,
            file_type: document.file_type,
            storage_path: document.storage_path,
            file_url: document.file_url,
            file_size: document.file_size,
            checksum: document.checksum,
            extracted_text: None,
            status: IngestionStatus::Pending,
            created_at: Utc::now(),
        };
        tables.documents.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.tables().documents.get(&id).cloned())
    }

    async fn documents_for_agents(
        &self,
        agent_ids: &[AgentId],
    ) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .tables()
            .documents
            .values()
            .filter(|document| agent_ids.contains(&document.agent_id))
            .cloned()
            .collect())
    }

    async fn set_extracted_text(&self, id: DocumentId, text: &str) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let document = tables.documents.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "document",
            id,
        })?;
        document.extracted_text = Some(text.to_string());
        Ok(())
    }

    async fn set_status(&self, id: DocumentId, status: IngestionStatus) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let document = tables.documents.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "document",
            id,
        })?;
        document.status = status;
        Ok(())
    }

    async fn delete_document(&self, id: DocumentId) -> Result<(), StoreError> {
        let mut tables = self.tables();
        tables.documents.remove(&id);
        tables.chunks.retain(|_, chunk| chunk.document_id != id);
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn insert_chunk(&self, chunk: NewChunk) -> Result<Chunk, StoreError> {
        let mut tables = self.tables();
        if tables.failing_chunk_inserts > 0 {
            tables.failing_chunk_inserts -= 1;
            return Err(unavailable("chunk insert rejected"));
        }
        let stored = Chunk {
            id: tables.next_id(),
            document_id: chunk.document_id,
            agent_id: chunk.agent_id,
            content: chunk.content,
            source: chunk.source,
            embedding: chunk.embedding,
        };
        tables.chunks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn chunks_for_agents(
        &self,
        agent_ids: &[AgentId],
    ) -> Result<Vec<ScopedChunk>, StoreError> {
        let tables = self.tables();
        Ok(tables
            .chunks
            .values()
            .filter(|chunk| agent_ids.contains(&chunk.agent_id))
            .map(|chunk| ScopedChunk {
                chunk: chunk.clone(),
                file_name: tables
                    .documents
                    .get(&chunk.document_id)
                    .map(|document| document.file_name.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
            })
            .collect())
    }

    async fn count_chunks(&self, document_id: DocumentId) -> Result<usize, StoreError> {
        Ok(self
            .tables()
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .count())
    }

    async fn delete_chunks_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables();
        let before = tables.chunks.len();
        tables.chunks.retain(|_, chunk| chunk.document_id != document_id);
        Ok(before - tables.chunks.len())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn get_chat(&self, id: ChatId) -> Result<Option<Chat>, StoreError> {
        Ok(self.tables().chats.get(&id).cloned())
    }

    async fn messages(&self, chat_id: ChatId) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .tables()
            .messages
            .values()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut tables = self.tables();
        let stored = ChatMessage {
            id: tables.next_id(),
            chat_id: message.chat_id,
            role: message.role,
            content: message.content,
            created_at: Utc::now(),
        };
        tables.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }
}
