pub mod chunking;
pub mod completion;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod stores;
pub mod traits;

pub use chunking::{chunk_text, chunk_text_with_limit, source_label, ChunkingConfig};
pub use completion::{OpenAiChatModel, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
pub use config::{OpenAiConfig, SupabaseConfig};
pub use context::format_context;
pub use embeddings::{
    cosine_similarity, CharacterNgramEmbedder, EmbeddingEngine, OpenAiEmbedder, RetryPolicy,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{CompletionError, EmbeddingError, IngestError, StoreError};
pub use extractor::{extract, extract_from_url, FileKind};
pub use ingest::{
    digest_bytes, discover_files, FolderIngestion, IngestionPipeline, IngestionReport,
    SkippedFile, UploadRequest, UploadedDocument, MAX_UPLOAD_BYTES,
};
pub use models::{
    Agent, AgentId, Chat, ChatId, ChatMessage, Chunk, ChunkId, CorpusScope, Document, DocumentId,
    IngestionStatus, NewChunk, NewDocument, NewMessage, PromptMessage, RetrievalRequest,
    RetrievedChunk, Role, ScopedChunk, ScoringMode,
};
pub use orchestrator::ChatService;
pub use retrieval::{extract_keywords, keyword_score, KeywordQuery, Retriever};
pub use stores::{MemoryStore, SupabaseStore};
pub use traits::{
    AgentStore, BlobStore, ChatModel, ChatStore, ChunkStore, DocumentStore, EmbeddingProvider,
    RelationalStore,
};
