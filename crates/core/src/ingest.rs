use crate::chunking::{chunk_text, source_label, ChunkingConfig};
use crate::embeddings::EmbeddingEngine;
use crate::error::{IngestError, StoreError};
use crate::extractor::{extract, extract_from_url, FileKind};
use crate::models::{
    AgentId, Document, DocumentId, IngestionStatus, NewChunk, NewDocument,
};
use crate::traits::{BlobStore, RelationalStore};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Largest accepted upload body.
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| FileKind::from_extension(name).is_supported());

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub agent_id: AgentId,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadRequest {
    pub fn new(
        agent_id: AgentId,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            agent_id,
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Reads a local file, guessing its content type from the extension.
    pub async fn from_path(agent_id: AgentId, path: &Path) -> Result<Self, IngestError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IngestError::InvalidArgument(format!("path missing filename: {}", path.display()))
            })?
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        let content_type = FileKind::from_extension(&file_name).content_type();

        Ok(Self::new(agent_id, file_name, content_type, bytes))
    }
}

/// Outcome of extracting, chunking and storing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionReport {
    pub document_id: DocumentId,
    pub text_chars: usize,
    pub chunks_total: usize,
    pub chunks_stored: usize,
    pub chunks_embedded: usize,
    pub status: IngestionStatus,
}

impl IngestionReport {
    fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            text_chars: 0,
            chunks_total: 0,
            chunks_stored: 0,
            chunks_embedded: 0,
            status: IngestionStatus::Failed,
        }
    }

    pub fn chunks_failed(&self) -> usize {
        self.chunks_total - self.chunks_stored
    }
}

/// A stored document whose background ingestion may still be running.
///
/// Dropping `ingestion` detaches the task; it keeps running.
pub struct UploadedDocument {
    pub document: Document,
    pub ingestion: JoinHandle<IngestionReport>,
}

pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

pub struct FolderIngestion {
    pub reports: Vec<IngestionReport>,
    pub skipped_files: Vec<SkippedFile>,
}

#[derive(Clone)]
pub struct IngestionPipeline {
    blobs: Arc<dyn BlobStore>,
    store: Arc<dyn RelationalStore>,
    embeddings: EmbeddingEngine,
    chunking: ChunkingConfig,
    http: Client,
}

impl IngestionPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        store: Arc<dyn RelationalStore>,
        embeddings: EmbeddingEngine,
    ) -> Self {
        Self {
            blobs,
            store,
            embeddings,
            chunking: ChunkingConfig::default(),
            http: Client::new(),
        }
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Stores the file and its document row, then ingests it in the background.
    ///
    /// Returns as soon as the document row exists; the document stays
    /// `Pending` until the returned task finishes.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadedDocument, StoreError> {
        if request.bytes.len() > MAX_UPLOAD_BYTES {
            return Err(StoreError::PayloadTooLarge {
                size: request.bytes.len(),
                limit: MAX_UPLOAD_BYTES,
            });
        }
        if request.file_name.trim().is_empty() {
            return Err(StoreError::InvalidArgument("file name is empty".to_string()));
        }

        self.store
            .get_agent(request.agent_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "agent",
                id: request.agent_id,
            })?;

        let storage_path = format!(
            "agents/{}/{}-{}",
            request.agent_id,
            Uuid::new_v4(),
            request.file_name.replace(['/', '\\'], "_")
        );
        let stored_path = self
            .blobs
            .upload(&storage_path, &request.bytes, &request.content_type)
            .await?;

        let new_document = NewDocument {
            agent_id: request.agent_id,
            file_name: request.file_name.clone(),
            file_type: request.content_type.clone(),
            file_url: self.blobs.public_url(&stored_path),
            storage_path: stored_path.clone(),
            file_size: request.bytes.len(),
            checksum: digest_bytes(&request.bytes),
        };

        let document = match self.store.insert_document(new_document).await {
            Ok(document) => document,
            Err(insert_error) => {
                if let Err(error) = self.blobs.remove(&stored_path).await {
                    warn!(path = %stored_path, %error, "could not remove orphaned blob");
                }
                return Err(insert_error);
            }
        };

        info!(
            document_id = document.id,
            agent_id = document.agent_id,
            file_name = %document.file_name,
            size = document.file_size,
            "document uploaded"
        );

        let pipeline = self.clone();
        let background = document.clone();
        let ingestion = tokio::spawn(async move {
            let text = extract_off_thread(
                request.bytes,
                background.file_type.clone(),
                background.file_name.clone(),
            )
            .await;
            pipeline.process_document(&background, &text).await
        });

        Ok(UploadedDocument {
            document,
            ingestion,
        })
    }

    /// Stores `text` on the document, chunks it and stores each chunk.
    ///
    /// Chunks are inserted one at a time in text order. A failed insert is
    /// logged and skipped, so a document can end up partially searchable.
    pub async fn process_document(&self, document: &Document, text: &str) -> IngestionReport {
        let mut report = IngestionReport::new(document.id);
        report.text_chars = text.chars().count();

        if let Err(error) = self.store.set_extracted_text(document.id, text).await {
            error!(document_id = document.id, %error, "could not store extracted text");
            self.finish(&mut report, IngestionStatus::Failed).await;
            return report;
        }

        let chunks = chunk_text(text, self.chunking);
        report.chunks_total = chunks.len();

        if chunks.is_empty() {
            warn!(
                document_id = document.id,
                file_name = %document.file_name,
                "no text extracted; document will not be searchable"
            );
            self.finish(&mut report, IngestionStatus::Failed).await;
            return report;
        }

        let total = chunks.len();
        for (index, content) in chunks.into_iter().enumerate() {
            let embedding = self.embeddings.embed(&content).await;
            let embedded = embedding.is_some();

            let chunk = NewChunk {
                document_id: document.id,
                agent_id: document.agent_id,
                source: source_label(&document.file_name, index, total),
                content,
                embedding,
            };

            match self.store.insert_chunk(chunk).await {
                Ok(stored) => {
                    report.chunks_stored += 1;
                    if embedded {
                        report.chunks_embedded += 1;
                    }
                    debug!(document_id = document.id, chunk_id = stored.id, embedded, "stored chunk");
                }
                Err(error) => {
                    warn!(document_id = document.id, index, %error, "could not store chunk");
                }
            }
        }

        let status = if report.chunks_stored > 0 {
            IngestionStatus::Ready
        } else {
            IngestionStatus::Failed
        };
        self.finish(&mut report, status).await;

        info!(
            document_id = document.id,
            chunks = report.chunks_stored,
            failed = report.chunks_failed(),
            embedded = report.chunks_embedded,
            status = report.status.as_str(),
            "document processed"
        );
        report
    }

    async fn finish(&self, report: &mut IngestionReport, status: IngestionStatus) {
        report.status = status;
        if let Err(error) = self.store.set_status(report.document_id, status).await {
            error!(document_id = report.document_id, %error, "could not record ingestion status");
        }
    }

    /// Extracts the document's stored file again and replaces its chunks.
    ///
    /// PDFs with an http(s) URL are extracted by reference; everything else is
    /// downloaded from the blob store. Existing chunks and status are left alone
    /// when the file cannot be fetched or yields no text.
    pub async fn reprocess(&self, document_id: DocumentId) -> Result<IngestionReport, StoreError> {
        let document = self.require_document(document_id).await?;

        let by_reference = FileKind::detect(&document.file_type, &document.file_name)
            == FileKind::Pdf
            && (document.file_url.starts_with("http://")
                || document.file_url.starts_with("https://"));

        let text = if by_reference {
            extract_from_url(
                &self.http,
                &document.file_url,
                &document.file_type,
                &document.file_name,
            )
            .await
        } else {
            let bytes = self.blobs.download(&document.storage_path).await?;
            extract_off_thread(bytes, document.file_type.clone(), document.file_name.clone()).await
        };

        if text.trim().is_empty() {
            warn!(
                document_id,
                file_name = %document.file_name,
                "reprocess extracted no text; keeping existing chunks"
            );
            return Err(StoreError::NothingExtracted(document_id));
        }

        let removed = self.store.delete_chunks_for_document(document_id).await?;
        self.store
            .set_status(document_id, IngestionStatus::Pending)
            .await?;
        debug!(document_id, removed, "cleared chunks for reprocessing");

        Ok(self.process_document(&document, &text).await)
    }

    /// Removes the document's chunks, its row and finally its stored file.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        let document = self.require_document(document_id).await?;

        let removed = self.store.delete_chunks_for_document(document_id).await?;
        self.store.delete_document(document_id).await?;

        if !document.storage_path.is_empty() {
            if let Err(error) = self.blobs.remove(&document.storage_path).await {
                warn!(document_id, path = %document.storage_path, %error, "could not remove stored file");
            }
        }

        info!(document_id, chunks = removed, "document deleted");
        Ok(())
    }

    /// Documents owned by one agent, newest first.
    pub async fn list_documents(&self, agent_id: AgentId) -> Result<Vec<Document>, StoreError> {
        let mut documents = self.store.documents_for_agents(&[agent_id]).await?;
        documents.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(documents)
    }

    pub async fn chunk_count(&self, document_id: DocumentId) -> Result<usize, StoreError> {
        self.store.count_chunks(document_id).await
    }

    /// Uploads every supported file under `folder` and waits for each ingestion.
    pub async fn ingest_folder(
        &self,
        agent_id: AgentId,
        folder: &Path,
    ) -> Result<FolderIngestion, IngestError> {
        let files = discover_files(folder);

        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported files found in {}",
                folder.display()
            )));
        }

        let mut reports = Vec::new();
        let mut skipped_files = Vec::new();

        for path in files {
            match self.upload_and_wait(agent_id, &path).await {
                Ok(report) => reports.push(report),
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "skipping file");
                    skipped_files.push(SkippedFile { path, reason });
                }
            }
        }

        Ok(FolderIngestion {
            reports,
            skipped_files,
        })
    }

    async fn upload_and_wait(
        &self,
        agent_id: AgentId,
        path: &Path,
    ) -> Result<IngestionReport, String> {
        let request = UploadRequest::from_path(agent_id, path)
            .await
            .map_err(|error| error.to_string())?;
        let uploaded = self
            .upload(request)
            .await
            .map_err(|error| error.to_string())?;
        uploaded
            .ingestion
            .await
            .map_err(|error| format!("ingestion task failed: {error}"))
    }

    async fn require_document(&self, document_id: DocumentId) -> Result<Document, StoreError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "document",
                id: document_id,
            })
    }
}

/// Runs the synchronous extractor on the blocking pool.
async fn extract_off_thread(bytes: Vec<u8>, file_type: String, file_name: String) -> String {
    let name = file_name.clone();
    match tokio::task::spawn_blocking(move || extract(&bytes, &file_type, &file_name)).await {
        Ok(text) => text,
        Err(error) => {
            warn!(file_name = %name, %error, "extraction task failed");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::traits::{BlobStore, ChunkStore, DocumentStore};
    use std::fs;
    use tempfile::tempdir;

    fn pipeline(store: &Arc<MemoryStore>) -> IngestionPipeline {
        IngestionPipeline::new(store.clone(), store.clone(), EmbeddingEngine::disabled())
    }

    #[test]
    fn discover_files_is_recursive_and_skips_unknown_types(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        fs::write(base.join("notes.txt"), b"hello")?;
        fs::write(base.join("image.png"), b"\x89PNG")?;
        fs::write(nested.join("table.CSV"), b"a,b\n1,2")?;

        let files = discover_files(base);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|path| !path.ends_with("image.png")));
        Ok(())
    }

    #[test]
    fn digest_is_reproducible() {
        assert_eq!(digest_bytes(b"abc"), digest_bytes(b"abc"));
        assert_ne!(digest_bytes(b"abc"), digest_bytes(b"abd"));
    }

    #[tokio::test]
    async fn upload_rejects_unknown_agents() {
        let store = Arc::new(MemoryStore::new());
        let result = pipeline(&store)
            .upload(UploadRequest::new(77, "a.txt", "text/plain", b"x".to_vec()))
            .await;

        assert!(matches!(result, Err(StoreError::NotFound { entity: "agent", .. })));
        assert_eq!(store.blob_count(), 0);
    }

    #[tokio::test]
    async fn upload_returns_a_pending_document_and_ingests_in_background() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);

        let uploaded = pipeline(&store)
            .upload(UploadRequest::new(
                agent.id,
                "notes.txt",
                "text/plain",
                b"First paragraph.\n\nSecond paragraph.".to_vec(),
            ))
            .await
            .expect("upload");

        assert_eq!(uploaded.document.status, IngestionStatus::Pending);
        assert!(uploaded
            .document
            .storage_path
            .starts_with(&format!("agents/{}/", agent.id)));
        assert_eq!(uploaded.document.checksum.len(), 64);

        let report = uploaded.ingestion.await.expect("ingestion task");
        assert_eq!(report.status, IngestionStatus::Ready);
        assert_eq!(report.chunks_stored, 1);

        let stored = store
            .get_document(uploaded.document.id)
            .await
            .expect("lookup")
            .expect("document");
        assert!(stored.is_ready());
        assert_eq!(
            stored.extracted_text.as_deref(),
            Some("First paragraph.\n\nSecond paragraph.")
        );
    }

    #[tokio::test]
    async fn partial_chunk_failures_leave_the_rest_searchable() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);
        let pipeline = pipeline(&store).with_chunking(ChunkingConfig { max_chars: 10 });
        let document = store
            .insert_document(NewDocument {
                agent_id: agent.id,
                file_name: "long.txt".to_string(),
                file_type: "text/plain".to_string(),
                storage_path: String::new(),
                file_url: String::new(),
                file_size: 0,
                checksum: String::new(),
            })
            .await
            .expect("document");

        store.fail_next_chunk_inserts(1);
        let report = pipeline
            .process_document(&document, "first part\n\nsecond part\n\nthird part")
            .await;

        assert_eq!(report.chunks_total, 3);
        assert_eq!(report.chunks_stored, 2);
        assert_eq!(report.chunks_failed(), 1);
        assert_eq!(report.status, IngestionStatus::Ready);

        let scoped = store.chunks_for_agents(&[agent.id]).await.expect("chunks");
        let sources: Vec<_> = scoped.iter().map(|row| row.chunk.source.as_str()).collect();
        assert_eq!(sources, vec!["long.txt (chunk 2/3)", "long.txt (chunk 3/3)"]);
    }

    #[tokio::test]
    async fn empty_text_marks_the_document_failed() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);
        let uploaded = pipeline(&store)
            .upload(UploadRequest::new(agent.id, "blank.txt", "text/plain", b"  \n\n ".to_vec()))
            .await
            .expect("upload");

        let report = uploaded.ingestion.await.expect("ingestion task");
        assert_eq!(report.status, IngestionStatus::Failed);
        assert_eq!(report.chunks_total, 0);
    }

    #[tokio::test]
    async fn reprocess_replaces_existing_chunks() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);
        let pipeline = pipeline(&store);
        let uploaded = pipeline
            .upload(UploadRequest::new(agent.id, "a.md", "text/markdown", b"# Title".to_vec()))
            .await
            .expect("upload");
        uploaded.ingestion.await.expect("ingestion task");

        let report = pipeline
            .reprocess(uploaded.document.id)
            .await
            .expect("reprocess");
        assert_eq!(report.chunks_stored, 1);
        assert_eq!(
            pipeline
                .chunk_count(uploaded.document.id)
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn reprocess_keeps_chunks_when_the_file_is_gone() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);
        let pipeline = pipeline(&store);
        let uploaded = pipeline
            .upload(UploadRequest::new(agent.id, "a.txt", "text/plain", b"content".to_vec()))
            .await
            .expect("upload");
        uploaded.ingestion.await.expect("ingestion task");

        store
            .remove(&uploaded.document.storage_path)
            .await
            .expect("remove blob");
        assert!(pipeline.reprocess(uploaded.document.id).await.is_err());

        assert_eq!(
            pipeline
                .chunk_count(uploaded.document.id)
                .await
                .expect("count"),
            1
        );
        let stored = store
            .get_document(uploaded.document.id)
            .await
            .expect("lookup")
            .expect("document");
        assert_eq!(stored.status, IngestionStatus::Ready);
    }

    #[tokio::test]
    async fn reprocess_without_text_keeps_the_previous_chunks() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);
        let pipeline = pipeline(&store);
        let uploaded = pipeline
            .upload(UploadRequest::new(agent.id, "a.txt", "text/plain", b"content".to_vec()))
            .await
            .expect("upload");
        uploaded.ingestion.await.expect("ingestion task");

        store
            .upload(&uploaded.document.storage_path, b"   \n", "text/plain")
            .await
            .expect("overwrite blob");

        assert!(matches!(
            pipeline.reprocess(uploaded.document.id).await,
            Err(StoreError::NothingExtracted(id)) if id == uploaded.document.id
        ));
        assert_eq!(store.chunk_count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_chunks_row_and_blob() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);
        let pipeline = pipeline(&store);
        let uploaded = pipeline
            .upload(UploadRequest::new(agent.id, "a.txt", "text/plain", b"content".to_vec()))
            .await
            .expect("upload");
        uploaded.ingestion.await.expect("ingestion task");

        pipeline
            .delete_document(uploaded.document.id)
            .await
            .expect("delete");

        assert_eq!(store.chunk_count(), 0);
        assert_eq!(store.blob_count(), 0);
        assert!(pipeline
            .list_documents(agent.id)
            .await
            .expect("list")
            .is_empty());
        assert!(matches!(
            pipeline.delete_document(uploaded.document.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn folder_ingestion_fails_without_supported_files(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("binary.bin"), b"\x00\x01")?;
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);

        let result = pipeline(&store).ingest_folder(agent.id, dir.path()).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn folder_ingestion_processes_each_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.txt"), b"alpha")?;
        fs::write(dir.path().join("b.json"), br#"{"key":"value"}"#)?;
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("support", false, None);

        let outcome = pipeline(&store).ingest_folder(agent.id, dir.path()).await?;
        assert_eq!(outcome.reports.len(), 2);
        assert!(outcome.skipped_files.is_empty());
        assert_eq!(store.chunk_count(), 2);
        Ok(())
    }
}
