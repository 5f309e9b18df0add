pub const DEFAULT_MAX_CHUNK_CHARS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Upper bound in characters; a single longer paragraph is still kept whole.
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }
}

/// Splits text on blank lines, keeping any whitespace-only line as a separator.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !lines.is_empty() {
                paragraphs.push(lines.join("\n"));
                lines.clear();
            }
        } else {
            lines.push(line);
        }
    }

    if !lines.is_empty() {
        paragraphs.push(lines.join("\n"));
    }

    paragraphs
}

/// Greedily packs paragraphs into chunks of at most `config.max_chars` characters.
pub fn chunk_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for paragraph in split_paragraphs(text) {
        let paragraph_chars = paragraph.chars().count();

        if !current.is_empty() && current_chars + paragraph_chars > config.max_chars {
            push_trimmed(&mut chunks, &current);
            current.clear();
            current_chars = 0;
        }

        current.push_str(&paragraph);
        current.push_str("\n\n");
        current_chars += paragraph_chars + 2;
    }

    push_trimmed(&mut chunks, &current);
    chunks
}

pub fn chunk_text_with_limit(text: &str, max_chars: usize) -> Vec<String> {
    chunk_text(text, ChunkingConfig { max_chars })
}

fn push_trimmed(chunks: &mut Vec<String>, buffer: &str) {
    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Attribution shown to the model, e.g. `handbook.pdf (chunk 2/7)`.
pub fn source_label(file_name: &str, index: usize, total: usize) -> String {
    format!("{file_name} (chunk {}/{total})", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(chunk_text("", ChunkingConfig::default()).is_empty());
        assert!(chunk_text(" \n\n \t\n", ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn short_text_stays_in_one_chunk() {
        let chunks = chunk_text_with_limit("Alpha beta.\n\nGamma delta epsilon.", 1000);
        assert_eq!(chunks, vec!["Alpha beta.\n\nGamma delta epsilon.".to_string()]);
    }

    #[test]
    fn paragraphs_are_packed_until_the_limit() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let chunks = chunk_text_with_limit(text, 10);
        assert_eq!(chunks, vec!["aaaa\n\nbbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn oversized_paragraph_is_kept_whole() {
        let long = "x".repeat(50);
        let text = format!("short\n\n{long}\n\ntail");
        let chunks = chunk_text_with_limit(&text, 20);
        assert_eq!(chunks, vec!["short".to_string(), long, "tail".to_string()]);
    }

    #[test]
    fn chunks_respect_the_limit_unless_a_paragraph_is_oversized() {
        let text = (0..40)
            .map(|index| "word ".repeat(index % 7 + 1).trim().to_string())
            .collect::<Vec<_>>()
            .join("\n\n");
        for chunk in chunk_text_with_limit(&text, 60) {
            assert!(chunk.chars().count() <= 60, "chunk too long: {chunk:?}");
        }
    }

    #[test]
    fn limit_counts_characters_not_bytes() {
        let text = "ééééé\n\nüüüüü";
        let chunks = chunk_text_with_limit(text, 12);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn whitespace_only_lines_separate_paragraphs() {
        let text = "one\n   \t\ntwo\r\n\r\nthree";
        assert_eq!(split_paragraphs(text), vec!["one", "two", "three"]);
    }

    #[test]
    fn joined_chunks_preserve_every_paragraph() {
        let text = "First paragraph.\n\n\n\nSecond one\nwith two lines.\n\nThird.";
        let chunks = chunk_text_with_limit(text, 20);
        let rejoined = chunks.join("\n\n");
        assert_eq!(split_paragraphs(&rejoined), split_paragraphs(text));
    }

    #[test]
    fn source_label_is_one_based() {
        assert_eq!(source_label("notes.txt", 0, 3), "notes.txt (chunk 1/3)");
    }
}
