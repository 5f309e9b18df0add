use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("docx archive error: {0}")]
    Docx(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("text is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url extraction is not supported for {0}")]
    UnsupportedUrlType(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("no text could be extracted from document {0}")]
    NothingExtracted(i64),

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding backend returned {status}: {details}")]
    BackendResponse { status: u16, details: String },

    #[error("embedding response contained no vector")]
    EmptyResponse,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion backend returned {status}: {details}")]
    BackendResponse { status: u16, details: String },

    #[error("completion response contained no choices")]
    EmptyResponse,
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
