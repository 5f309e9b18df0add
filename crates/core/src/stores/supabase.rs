use crate::config::SupabaseConfig;
use crate::error::StoreError;
use crate::models::{
    Agent, AgentId, Chat, ChatId, ChatMessage, Chunk, Document, DocumentId, IngestionStatus,
    NewChunk, NewDocument, NewMessage, ScopedChunk,
};
use crate::traits::{AgentStore, BlobStore, ChatStore, ChunkStore, DocumentStore};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

const BACKEND: &str = "supabase";

/// PostgREST tables and the Storage bucket of one Supabase project.
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    api_key: String,
    bucket: String,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.url,
            api_key: config.api_key,
            bucket: config.bucket,
        }
    }

    fn table(&self, method: Method, table: &str) -> Result<RequestBuilder, StoreError> {
        let url = Url::parse(&format!("{}/rest/v1/{table}", self.base_url))?;
        Ok(self
            .client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation"))
    }

    /// `{base}/storage/v1/object/{prefix..}/{bucket}/{path}` with every segment percent-encoded.
    fn storage_url(&self, prefix: &[&str], path: &str) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| {
                StoreError::InvalidArgument(format!("{} cannot be a base url", self.base_url))
            })?
            .pop_if_empty()
            .extend(["storage", "v1", "object"])
            .extend(prefix)
            .push(&self.bucket)
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        Ok(url)
    }

    fn object_url(&self, path: &str) -> Result<Url, StoreError> {
        self.storage_url(&[], path)
    }

    async fn rows(&self, request: RequestBuilder) -> Result<Vec<Value>, StoreError> {
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {body}"),
            });
        }

        match response.json::<Value>().await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            row => Ok(vec![row]),
        }
    }

    async fn typed_rows<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Vec<T>, StoreError> {
        self.rows(request)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(StoreError::from))
            .collect()
    }

    async fn inserted_row<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        table: &str,
    ) -> Result<T, StoreError> {
        self.typed_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("insert into {table} returned no row"),
            })
    }
}

fn eq(value: i64) -> String {
    format!("eq.{value}")
}

fn in_list(ids: &[i64]) -> String {
    let joined = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({joined})")
}

/// pgvector columns come back either as JSON arrays or as `"[0.1,0.2]"` strings.
fn parse_embedding(value: Option<&Value>) -> Option<Vec<f32>> {
    let parsed: Option<Vec<f32>> = match value? {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_f64().map(|number| number as f32))
            .collect(),
        Value::String(text) => {
            let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
            if inner.trim().is_empty() {
                return None;
            }
            inner
                .split(',')
                .map(|item| item.trim().parse::<f32>().ok())
                .collect()
        }
        _ => None,
    };
    parsed.filter(|vector| !vector.is_empty())
}

fn row_to_scoped_chunk(row: &Value) -> Result<ScopedChunk, StoreError> {
    let int = |pointer: &str| {
        row.pointer(pointer)
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("chunk row is missing {pointer}"),
            })
    };
    let text = |pointer: &str| {
        row.pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let file_name = row
        .pointer("/documents/file_name")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();

    Ok(ScopedChunk {
        chunk: Chunk {
            id: int("/id")?,
            document_id: int("/document_id")?,
            agent_id: int("/agent_id")?,
            content: text("/content"),
            source: text("/source"),
            embedding: parse_embedding(row.pointer("/embedding")),
        },
        file_name,
    })
}

/// Parses chunk rows, skipping any row that cannot be read.
fn scoped_chunks(rows: &[Value]) -> Vec<ScopedChunk> {
    rows.iter()
        .filter_map(|row| match row_to_scoped_chunk(row) {
            Ok(scoped) => Some(scoped),
            Err(error) => {
                let row_id = row.get("id").cloned().unwrap_or(Value::Null);
                warn!(%row_id, %error, "skipping unreadable chunk row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl BlobStore for SupabaseStore {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError> {
        let response = self
            .client
            .post(self.object_url(path)?)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("content-type", content_type)
            .header("x-upsert", "false")
            .body(bytes.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("storage upload {status}: {body}"),
            });
        }

        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get(self.object_url(path)?)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("storage download {}", response.status()),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    fn public_url(&self, path: &str) -> String {
        match self.storage_url(&["public"], path) {
            Ok(url) => url.to_string(),
            Err(error) => {
                warn!(path, %error, "could not build public url");
                String::new()
            }
        }
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.storage_url(&[], "")?)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&json!({ "prefixes": [path] }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("storage delete {}", response.status()),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl AgentStore for SupabaseStore {
    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>, StoreError> {
        let request = self
            .table(Method::GET, "agents")?
            .query(&[("id", eq(id)), ("select", "*".to_string())]);
        Ok(self.typed_rows(request).await?.into_iter().next())
    }

    async fn child_agents(&self, parent_id: AgentId) -> Result<Vec<Agent>, StoreError> {
        let request = self.table(Method::GET, "agents")?.query(&[
            ("parent_id", eq(parent_id)),
            ("select", "*".to_string()),
            ("order", "id.asc".to_string()),
        ]);
        self.typed_rows(request).await
    }
}

#[async_trait]
impl DocumentStore for SupabaseStore {
    async fn insert_document(&self, document: NewDocument) -> Result<Document, StoreError> {
        let request = self.table(Method::POST, "documents")?.json(&json!({
            "agent_id": document.agent_id,
            "file_name": document.file_name,
            "file_type": document.file_type,
            "storage_path": document.storage_path,
            "file_url": document.file_url,
            "file_size": document.file_size,
            "checksum": document.checksum,
            "status": IngestionStatus::Pending,
        }));
        self.inserted_row(request, "documents").await
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let request = self
            .table(Method::GET, "documents")?
            .query(&[("id", eq(id)), ("select", "*".to_string())]);
        Ok(self.typed_rows(request).await?.into_iter().next())
    }

    async fn documents_for_agents(
        &self,
        agent_ids: &[AgentId],
    ) -> Result<Vec<Document>, StoreError> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = self.table(Method::GET, "documents")?.query(&[
            ("agent_id", in_list(agent_ids)),
            ("select", "*".to_string()),
            ("order", "created_at.desc".to_string()),
        ]);
        self.typed_rows(request).await
    }

    async fn set_extracted_text(&self, id: DocumentId, text: &str) -> Result<(), StoreError> {
        let request = self
            .table(Method::PATCH, "documents")?
            .query(&[("id", eq(id))])
            .json(&json!({ "extracted_text": text }));
        let updated = self.rows(request).await?;
        if updated.is_empty() {
            return Err(StoreError::NotFound {
                entity: "document",
                id,
            });
        }
        Ok(())
    }

    async fn set_status(&self, id: DocumentId, status: IngestionStatus) -> Result<(), StoreError> {
        let request = self
            .table(Method::PATCH, "documents")?
            .query(&[("id", eq(id))])
            .json(&json!({ "status": status }));
        let updated = self.rows(request).await?;
        if updated.is_empty() {
            return Err(StoreError::NotFound {
                entity: "document",
                id,
            });
        }
        Ok(())
    }

    async fn delete_document(&self, id: DocumentId) -> Result<(), StoreError> {
        let request = self
            .table(Method::DELETE, "documents")?
            .query(&[("id", eq(id))]);
        self.rows(request).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for SupabaseStore {
    async fn insert_chunk(&self, chunk: NewChunk) -> Result<Chunk, StoreError> {
        let request = self.table(Method::POST, "chunks")?.json(&json!({
            "document_id": chunk.document_id,
            "agent_id": chunk.agent_id,
            "content": chunk.content,
            "source": chunk.source,
            "embedding": chunk.embedding,
        }));
        let rows = self.rows(request).await?;
        let row = rows.first().ok_or_else(|| StoreError::BackendResponse {
            backend: BACKEND.to_string(),
            details: "chunk insert returned no row".to_string(),
        })?;
        Ok(row_to_scoped_chunk(row)?.chunk)
    }

    async fn chunks_for_agents(
        &self,
        agent_ids: &[AgentId],
    ) -> Result<Vec<ScopedChunk>, StoreError> {
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = self.table(Method::GET, "chunks")?.query(&[
            ("agent_id", in_list(agent_ids)),
            ("select", "*,documents(file_name)".to_string()),
            ("order", "id.asc".to_string()),
        ]);
        Ok(scoped_chunks(&self.rows(request).await?))
    }

    async fn count_chunks(&self, document_id: DocumentId) -> Result<usize, StoreError> {
        let request = self
            .table(Method::GET, "chunks")?
            .query(&[("document_id", eq(document_id)), ("select", "id".to_string())]);
        Ok(self.rows(request).await?.len())
    }

    async fn delete_chunks_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<usize, StoreError> {
        let request = self
            .table(Method::DELETE, "chunks")?
            .query(&[("document_id", eq(document_id))]);
        Ok(self.rows(request).await?.len())
    }
}

#[async_trait]
impl ChatStore for SupabaseStore {
    async fn get_chat(&self, id: ChatId) -> Result<Option<Chat>, StoreError> {
        let request = self
            .table(Method::GET, "chats")?
            .query(&[("id", eq(id)), ("select", "*".to_string())]);
        Ok(self.typed_rows(request).await?.into_iter().next())
    }

    async fn messages(&self, chat_id: ChatId) -> Result<Vec<ChatMessage>, StoreError> {
        let request = self.table(Method::GET, "messages")?.query(&[
            ("chat_id", eq(chat_id)),
            ("select", "*".to_string()),
            ("order", "created_at.asc,id.asc".to_string()),
        ]);
        self.typed_rows(request).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let request = self.table(Method::POST, "messages")?.json(&message);
        self.inserted_row(request, "messages").await
    }
}
