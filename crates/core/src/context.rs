use crate::models::RetrievedChunk;

pub const CONTEXT_PREAMBLE: &str =
    "Here are some relevant documents that might help you answer the question:";
pub const CONTEXT_INSTRUCTION: &str = "Please use this information to help answer the user's question. If the information provided doesn't contain the answer, please say so.";
pub const NO_CONTEXT_NOTICE: &str = "Note: No relevant documents were found in the knowledge base for this query. Answer based on your general knowledge and let the user know that no specific documents matched.";

/// Renders retrieved chunks as a prompt block. No chunks, no block.
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return String::new();
    }

    let mut context = format!("{CONTEXT_PREAMBLE}\n\n");
    for (index, retrieved) in chunks.iter().enumerate() {
        context.push_str(&format!(
            "Document {}: {}\nContent: {}\n\n",
            index + 1,
            retrieved.source_document,
            retrieved.chunk.content
        ));
    }
    context.push_str(CONTEXT_INSTRUCTION);
    context
}
