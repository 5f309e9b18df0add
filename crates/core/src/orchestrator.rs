use crate::context::{format_context, NO_CONTEXT_NOTICE};
use crate::error::StoreError;
use crate::models::{
    ChatId, ChatMessage, NewMessage, PromptMessage, RetrievalRequest, Role,
    DEFAULT_RETRIEVAL_LIMIT,
};
use crate::retrieval::Retriever;
use crate::traits::{ChatModel, RelationalStore};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SYSTEM_PROMPT_PREFIX: &str = "You are an AI assistant.";
pub const FALLBACK_REPLY: &str =
    "I apologize, but I encountered an error processing your request. Please try again later.";

/// Answers chat messages grounded on the chat agent's documents.
pub struct ChatService {
    store: Arc<dyn RelationalStore>,
    retriever: Retriever,
    model: Arc<dyn ChatModel>,
    retrieval_limit: usize,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        retriever: Retriever,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            store,
            retriever,
            model,
            retrieval_limit: DEFAULT_RETRIEVAL_LIMIT,
        }
    }

    /// Persists the user's message and the assistant's reply, returning the
    /// whole conversation oldest first.
    ///
    /// A failed completion still persists a reply: [`FALLBACK_REPLY`].
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let chat = self.store.get_chat(chat_id).await?.ok_or(StoreError::NotFound {
            entity: "chat",
            id: chat_id,
        })?;

        let history = self.store.messages(chat_id).await?;
        self.store
            .insert_message(NewMessage {
                chat_id,
                role: Role::User,
                content: text.to_string(),
            })
            .await?;

        let request = match self.store.get_agent(chat.agent_id).await {
            Ok(Some(agent)) => RetrievalRequest::new(agent.id, text)
                .with_limit(self.retrieval_limit)
                .with_parent_docs(agent.is_child())
                .with_child_agents(agent.is_parent),
            Ok(None) => {
                warn!(chat_id, agent_id = chat.agent_id, "chat agent not found");
                RetrievalRequest::new(chat.agent_id, text).with_limit(self.retrieval_limit)
            }
            Err(error) => {
                warn!(chat_id, agent_id = chat.agent_id, %error, "chat agent lookup failed");
                RetrievalRequest::new(chat.agent_id, text).with_limit(self.retrieval_limit)
            }
        };

        let retrieved = self.retriever.retrieve(&request).await;
        let context = format_context(&retrieved);
        debug!(chat_id, chunks = retrieved.len(), "grounding context built");

        let prompt = build_prompt(&history, text, &context);

        let reply = match self.model.complete(&prompt).await {
            Ok(reply) => reply,
            Err(error) => {
                error!(chat_id, %error, "completion failed; sending fallback reply");
                FALLBACK_REPLY.to_string()
            }
        };

        self.store
            .insert_message(NewMessage {
                chat_id,
                role: Role::Assistant,
                content: reply,
            })
            .await?;

        info!(chat_id, grounded = !retrieved.is_empty(), "chat message answered");
        self.store.messages(chat_id).await
    }
}

/// Prior turns plus the new user message, with the grounding context merged
/// into the system message.
pub fn build_prompt(history: &[ChatMessage], text: &str, context: &str) -> Vec<PromptMessage> {
    let mut prompt: Vec<PromptMessage> = history
        .iter()
        .map(|message| PromptMessage::new(message.role, message.content.clone()))
        .collect();

    if context.is_empty() {
        prompt.push(PromptMessage::new(Role::System, NO_CONTEXT_NOTICE));
    } else if let Some(system) = prompt.iter_mut().find(|message| message.role == Role::System) {
        system.content = format!("{}\n\n{context}", system.content);
    } else {
        prompt.insert(
            0,
            PromptMessage::new(Role::System, format!("{SYSTEM_PROMPT_PREFIX} {context}")),
        );
    }

    prompt.push(PromptMessage::new(Role::User, text));
    prompt
}
