use crate::embeddings::{cosine_similarity, EmbeddingEngine};
use crate::error::StoreError;
use crate::models::{
    AgentId, CorpusScope, RetrievalRequest, RetrievedChunk, ScopedChunk, ScoringMode,
};
use crate::traits::RelationalStore;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Query keywords: whitespace tokens of at least three characters, lowercased,
/// with non-word characters removed.
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|token| token.chars().count() >= 3)
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|keyword| !keyword.is_empty())
        .collect()
}

/// Whole-word, case-insensitive matchers for one query.
#[derive(Debug, Clone)]
pub struct KeywordQuery {
    keywords: Vec<String>,
    matchers: Vec<Regex>,
}

impl KeywordQuery {
    pub fn parse(query: &str) -> Self {
        Self::from_keywords(extract_keywords(query))
    }

    pub fn from_keywords(keywords: Vec<String>) -> Self {
        let matchers = keywords
            .iter()
            .filter_map(|keyword| {
                match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(keyword))) {
                    Ok(matcher) => Some(matcher),
                    Err(error) => {
                        warn!(keyword = %keyword, %error, "skipping keyword");
                        None
                    }
                }
            })
            .collect();

        Self { keywords, matchers }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Sum over keywords of the number of whole-word occurrences in `content`.
    pub fn score(&self, content: &str) -> usize {
        self.matchers
            .iter()
            .map(|matcher| matcher.find_iter(content).count())
            .sum()
    }
}

pub fn keyword_score(content: &str, keywords: &[String]) -> usize {
    KeywordQuery::from_keywords(keywords.to_vec()).score(content)
}

/// Scores every candidate, then keeps the best `limit`.
///
/// A candidate is scored by cosine similarity when both it and the query have
/// an embedding, and by keyword overlap otherwise. Equal scores keep ascending
/// chunk id order.
pub fn rank_candidates(
    candidates: Vec<ScopedChunk>,
    query_embedding: Option<&[f32]>,
    keywords: &KeywordQuery,
    limit: usize,
) -> Vec<RetrievedChunk> {
    let mut scored: Vec<RetrievedChunk> = candidates
        .into_iter()
        .map(|candidate| {
            let (score, mode) = match (query_embedding, candidate.chunk.embedding.as_deref()) {
                (Some(query), Some(chunk)) => (
                    cosine_similarity(Some(query), Some(chunk)),
                    ScoringMode::Embedding,
                ),
                _ => (
                    keywords.score(&candidate.chunk.content) as f64,
                    ScoringMode::Keyword,
                ),
            };

            RetrievedChunk {
                chunk: candidate.chunk,
                score,
                source_document: candidate.file_name,
                mode,
            }
        })
        .collect();

    scored.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.chunk.id.cmp(&right.chunk.id))
    });
    scored.truncate(limit);
    scored
}

/// Resolves which agents a query may read from and ranks their chunks.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn RelationalStore>,
    embeddings: EmbeddingEngine,
}

impl Retriever {
    pub fn new(store: Arc<dyn RelationalStore>, embeddings: EmbeddingEngine) -> Self {
        Self { store, embeddings }
    }

    /// The agent itself, plus its parent and/or its children when asked for.
    /// Only one hop in either direction.
    pub async fn resolve_scope(
        &self,
        agent_id: AgentId,
        include_parent_docs: bool,
        include_child_agent_context: bool,
    ) -> Result<CorpusScope, StoreError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "agent",
                id: agent_id,
            })?;

        let mut scope = CorpusScope::new(agent_id);

        if include_parent_docs {
            if let Some(parent_id) = agent.parent_id {
                debug!(agent_id, parent_id, "including parent agent documents");
                scope.insert(parent_id);
            }
        }

        if include_child_agent_context && agent.is_parent {
            match self.store.child_agents(agent_id).await {
                Ok(children) => {
                    debug!(agent_id, children = children.len(), "including child agents");
                    for child in children {
                        scope.insert(child.id);
                    }
                }
                Err(error) => warn!(agent_id, %error, "child agent lookup failed"),
            }
        }

        Ok(scope)
    }

    /// Never fails: a scope or store failure yields no chunks.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Vec<RetrievedChunk> {
        let scope = match self
            .resolve_scope(
                request.agent_id,
                request.include_parent_docs,
                request.include_child_agent_context,
            )
            .await
        {
            Ok(scope) => scope,
            Err(error) => {
                warn!(agent_id = request.agent_id, %error, "could not resolve corpus scope");
                return Vec::new();
            }
        };

        let agent_ids = scope.agent_ids();
        let candidates = match self.store.chunks_for_agents(&agent_ids).await {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(?agent_ids, %error, "could not fetch candidate chunks");
                return Vec::new();
            }
        };

        debug!(?agent_ids, candidates = candidates.len(), "fetched candidate chunks");

        if candidates.is_empty() {
            self.report_unprocessed_documents(&agent_ids).await;
            return Vec::new();
        }

        let query_embedding = if candidates
            .iter()
            .any(|candidate| candidate.chunk.embedding.is_some())
        {
            self.embeddings.embed(&request.query).await
        } else {
            None
        };

        let keywords = KeywordQuery::parse(&request.query);
        let ranked = rank_candidates(
            candidates,
            query_embedding.as_deref(),
            &keywords,
            request.limit,
        );

        for (position, hit) in ranked.iter().enumerate() {
            debug!(
                rank = position + 1,
                score = hit.score,
                mode = ?hit.mode,
                document = %hit.source_document,
                "retrieved chunk"
            );
        }
        info!(
            agent_id = request.agent_id,
            results = ranked.len(),
            keywords = keywords.keywords().len(),
            "retrieval finished"
        );

        ranked
    }

    async fn report_unprocessed_documents(&self, agent_ids: &[AgentId]) {
        match self.store.documents_for_agents(agent_ids).await {
            Ok(documents) if !documents.is_empty() => {
                for document in documents {
                    warn!(
                        document_id = document.id,
                        file_name = %document.file_name,
                        status = document.status.as_str(),
                        "document has no chunks; it was not processed"
                    );
                }
            }
            Ok(_) => debug!(?agent_ids, "no documents in scope"),
            Err(error) => warn!(?agent_ids, %error, "could not list documents in scope"),
        }
    }
}
