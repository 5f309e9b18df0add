pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";
pub const DEFAULT_STORAGE_BUCKET: &str = "documents";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
        }
    }

    /// `None` unless `OPENAI_API_KEY` is set to a non-blank value.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let api_key = non_blank(lookup("OPENAI_API_KEY"))?;
        let mut config = Self::new(api_key);

        if let Some(base_url) = non_blank(lookup("OPENAI_BASE_URL")) {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(model) = non_blank(lookup("OPENAI_EMBEDDING_MODEL")) {
            config.embedding_model = model;
        }
        if let Some(model) = non_blank(lookup("OPENAI_CHAT_MODEL")) {
            config.chat_model = model;
        }

        Some(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseConfig {
    pub url: String,
    pub api_key: String,
    pub bucket: String,
}

impl SupabaseConfig {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let url = non_blank(lookup("SUPABASE_URL"))?;
        let api_key = non_blank(lookup("SUPABASE_KEY"))?;
        let bucket = non_blank(lookup("SUPABASE_BUCKET"))
            .unwrap_or_else(|| DEFAULT_STORAGE_BUCKET.to_string());

        Some(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key,
            bucket,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
