use agent_knowledge_core::{
    format_context, AgentId, CharacterNgramEmbedder, ChatService, ChunkingConfig, DocumentId,
    EmbeddingEngine, IngestionPipeline, MemoryStore, OpenAiChatModel, OpenAiConfig,
    OpenAiEmbedder, RetrievalRequest, RetrievedChunk, Retriever, RetryPolicy, SupabaseConfig,
    SupabaseStore, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "agent-knowledge", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Supabase project URL
    #[arg(long, env = "SUPABASE_URL", global = true)]
    supabase_url: Option<String>,

    /// Supabase service key
    #[arg(long, env = "SUPABASE_KEY", global = true, hide_env_values = true)]
    supabase_key: Option<String>,

    /// Storage bucket for uploaded files
    #[arg(long, env = "SUPABASE_BUCKET", global = true)]
    supabase_bucket: Option<String>,

    /// How chunks and queries are embedded.
    #[arg(long, value_enum, default_value_t = EmbedderChoice::Auto, global = true)]
    embedder: EmbedderChoice,

    /// Largest chunk, in characters.
    #[arg(long, default_value_t = 1000, global = true)]
    max_chunk_chars: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderChoice {
    /// OpenAI when `OPENAI_API_KEY` is set, otherwise none.
    Auto,
    Openai,
    /// Offline hashed character trigrams.
    Ngram,
    /// No embeddings; keyword scoring only.
    Keyword,
}

#[derive(Subcommand)]
enum Command {
    /// Upload every supported file in a folder to an agent and wait for ingestion.
    Ingest {
        #[arg(long)]
        agent_id: AgentId,
        /// Folder that contains documents recursively.
        #[arg(long)]
        folder: String,
    },
    /// Retrieve the chunks an agent would be grounded on for a query.
    Query {
        #[arg(long)]
        agent_id: AgentId,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "5")]
        limit: usize,
        /// Also search the parent agent's documents.
        #[arg(long, default_value_t = false)]
        include_parent: bool,
        /// Also search every child agent's documents.
        #[arg(long, default_value_t = false)]
        include_children: bool,
    },
    /// Send a message to a chat and print the reply.
    Chat {
        #[arg(long)]
        chat_id: i64,
        #[arg(long)]
        message: String,
        #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
        temperature: f32,
        #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
        max_tokens: u32,
    },
    /// Manage stored documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsCommand,
    },
    /// Ingest a folder into a throwaway in-memory agent and query it once.
    Ask {
        #[arg(long)]
        folder: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "5")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum DocumentsCommand {
    List {
        #[arg(long)]
        agent_id: AgentId,
    },
    Delete {
        #[arg(long)]
        id: DocumentId,
    },
    /// Drop a document's chunks and ingest it again.
    Reprocess {
        #[arg(long)]
        id: DocumentId,
    },
}

impl Command {
    /// Whether the command embeds chunks or queries.
    fn embeds(&self) -> bool {
        !matches!(
            self,
            Command::Documents {
                action: DocumentsCommand::List { .. } | DocumentsCommand::Delete { .. }
            }
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "agent-knowledge boot"
    );

    let embeddings = if cli.command.embeds() {
        embedding_engine(cli.embedder)?
    } else {
        EmbeddingEngine::disabled()
    };
    let chunking = ChunkingConfig {
        max_chars: cli.max_chunk_chars,
    };

    match &cli.command {
        Command::Ingest { agent_id, folder } => {
            let store = Arc::new(supabase_store(&cli)?);
            let pipeline =
                IngestionPipeline::new(store.clone(), store, embeddings).with_chunking(chunking);
            ingest_folder(&pipeline, *agent_id, folder).await?;
        }
        Command::Query {
            agent_id,
            query,
            limit,
            include_parent,
            include_children,
        } => {
            let store = Arc::new(supabase_store(&cli)?);
            let retriever = Retriever::new(store, embeddings);
            let request = RetrievalRequest::new(*agent_id, query.clone())
                .with_limit(*limit)
                .with_parent_docs(*include_parent)
                .with_child_agents(*include_children);

            print_hits(&retriever.retrieve(&request).await);
        }
        Command::Chat {
            chat_id,
            message,
            temperature,
            max_tokens,
        } => {
            let openai = OpenAiConfig::from_env()
                .ok_or_else(|| anyhow!("OPENAI_API_KEY is required for chat"))?;
            let store = Arc::new(supabase_store(&cli)?);
            let retriever = Retriever::new(store.clone(), embeddings);
            let model = OpenAiChatModel::new(openai)
                .with_temperature(*temperature)
                .with_max_tokens(*max_tokens);
            let service = ChatService::new(store, retriever, Arc::new(model));

            let history = service
                .send_message(*chat_id, message)
                .await
                .context("sending chat message")?;
            if let Some(reply) = history.last() {
                println!("{}", reply.content);
            }
        }
        Command::Documents { action } => {
            let store = Arc::new(supabase_store(&cli)?);
            let pipeline =
                IngestionPipeline::new(store.clone(), store, embeddings).with_chunking(chunking);

            match action {
                DocumentsCommand::List { agent_id } => {
                    for document in pipeline.list_documents(*agent_id).await? {
                        let chunks = pipeline.chunk_count(document.id).await?;
                        println!(
                            "{}\t{}\t{}\t{} bytes\t{} chunks\t{}",
                            document.id,
                            document.status.as_str(),
                            document.file_name,
                            document.file_size,
                            chunks,
                            document.created_at.to_rfc3339()
                        );
                    }
                }
                DocumentsCommand::Delete { id } => {
                    pipeline.delete_document(*id).await?;
                    println!("document {id} deleted");
                }
                DocumentsCommand::Reprocess { id } => {
                    let report = pipeline.reprocess(*id).await?;
                    println!(
                        "document {id}: {} of {} chunks stored ({})",
                        report.chunks_stored,
                        report.chunks_total,
                        report.status.as_str()
                    );
                }
            }
        }
        Command::Ask {
            folder,
            query,
            limit,
        } => {
            let store = Arc::new(MemoryStore::new());
            let agent = store.create_agent("ask", false, None);
            let pipeline = IngestionPipeline::new(store.clone(), store.clone(), embeddings.clone())
                .with_chunking(chunking);
            ingest_folder(&pipeline, agent.id, folder).await?;

            let retriever = Retriever::new(store, embeddings);
            let hits = retriever
                .retrieve(&RetrievalRequest::new(agent.id, query.clone()).with_limit(*limit))
                .await;

            if hits.is_empty() {
                println!("no matching chunks");
            } else {
                println!("{}", format_context(&hits));
            }
        }
    }

    Ok(())
}

fn embedding_engine(choice: EmbedderChoice) -> anyhow::Result<EmbeddingEngine> {
    let policy = RetryPolicy::default();

    let engine = match choice {
        EmbedderChoice::Auto => match OpenAiConfig::from_env() {
            Some(config) => EmbeddingEngine::new(Arc::new(OpenAiEmbedder::new(config)), policy),
            None => {
                warn!("OPENAI_API_KEY not set; retrieval will use keyword scoring");
                EmbeddingEngine::disabled()
            }
        },
        EmbedderChoice::Openai => {
            let config = OpenAiConfig::from_env()
                .ok_or_else(|| anyhow!("--embedder openai requires OPENAI_API_KEY"))?;
            EmbeddingEngine::new(Arc::new(OpenAiEmbedder::new(config)), policy)
        }
        EmbedderChoice::Ngram => {
            EmbeddingEngine::new(Arc::new(CharacterNgramEmbedder::default()), policy)
        }
        EmbedderChoice::Keyword => EmbeddingEngine::disabled(),
    };

    info!(embeddings = engine.is_enabled(), "embedding engine ready");
    Ok(engine)
}

fn supabase_store(cli: &Cli) -> anyhow::Result<SupabaseStore> {
    let lookup = |key: &str| match key {
        "SUPABASE_URL" => cli.supabase_url.clone(),
        "SUPABASE_KEY" => cli.supabase_key.clone(),
        "SUPABASE_BUCKET" => cli.supabase_bucket.clone(),
        _ => None,
    };

    let config = SupabaseConfig::from_lookup(lookup)
        .ok_or_else(|| anyhow!("--supabase-url and --supabase-key are required"))?;
    Ok(SupabaseStore::new(config))
}

async fn ingest_folder(
    pipeline: &IngestionPipeline,
    agent_id: AgentId,
    folder: &str,
) -> anyhow::Result<()> {
    let outcome = pipeline
        .ingest_folder(agent_id, Path::new(folder))
        .await
        .with_context(|| format!("ingesting {folder}"))?;

    if !outcome.skipped_files.is_empty() {
        warn!(
            skipped = outcome.skipped_files.len(),
            folder = %folder,
            "some files were skipped"
        );
        for skipped in &outcome.skipped_files {
            warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
        }
    }

    let chunks: usize = outcome.reports.iter().map(|report| report.chunks_stored).sum();
    let ready = outcome
        .reports
        .iter()
        .filter(|report| report.chunks_stored > 0)
        .count();

    println!(
        "{} documents ingested ({} searchable, {} chunks) at {}",
        outcome.reports.len(),
        ready,
        chunks,
        Utc::now().to_rfc3339()
    );
    Ok(())
}

fn print_hits(hits: &[RetrievedChunk]) {
    if hits.is_empty() {
        println!("no matching chunks");
        return;
    }

    for hit in hits {
        println!(
            "[{:?}] score={:.4} chunk={} source={}",
            hit.mode, hit.score, hit.chunk.id, hit.chunk.source
        );
        println!("  document={}", hit.source_document);
        println!("  chunk_text:\n{}", hit.chunk.content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("agent-knowledge").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn document_listing_and_deletion_skip_the_embedder() {
        assert!(!parse(&["documents", "list", "--agent-id", "1"]).command.embeds());
        assert!(!parse(&["documents", "delete", "--id", "4"]).command.embeds());
        assert!(parse(&["documents", "reprocess", "--id", "4"]).command.embeds());
        assert!(parse(&["query", "--agent-id", "1", "--query", "refunds"]).command.embeds());
    }

    #[test]
    fn chat_sampling_flags_default_to_the_model_settings() {
        let Command::Chat {
            temperature,
            max_tokens,
            ..
        } = parse(&["chat", "--chat-id", "3", "--message", "hi"]).command
        else {
            panic!("expected chat command");
        };
        assert_eq!(temperature, DEFAULT_TEMPERATURE);
        assert_eq!(max_tokens, DEFAULT_MAX_TOKENS);

        let Command::Chat {
            temperature,
            max_tokens,
            ..
        } = parse(&[
            "chat",
            "--chat-id",
            "3",
            "--message",
            "hi",
            "--temperature",
            "0.2",
            "--max-tokens",
            "256",
        ])
        .command
        else {
            panic!("expected chat command");
        };
        assert_eq!(temperature, 0.2);
        assert_eq!(max_tokens, 256);
    }
}
