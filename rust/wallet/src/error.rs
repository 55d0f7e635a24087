use thiserror::Error;
use zylith_prover::ProverError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{operation}: missing required fields: {}", .fields.join(", "))]
    MissingFields {
        operation: String,
        fields: Vec<String>,
    },
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("insufficient balance of {token}: requested {requested}, available {available}")]
    InsufficientBalance {
        token: String,
        requested: u128,
        available: u128,
    },
    #[error("note {commitment} already spent in {spent_in}, refusing {attempted}")]
    AlreadySpent {
        commitment: String,
        spent_in: String,
        attempted: String,
    },
    #[error("duplicate commitment {0}")]
    DuplicateCommitment(String),
    #[error("note {0} not found")]
    NoteNotFound(String),
    #[error("proof generation failed: {0}")]
    ProofGeneration(String),
    #[error("malformed proof response: {0}")]
    MalformedProofResponse(String),
    #[error("{entry_point} expects {expected} public inputs, got {actual}")]
    IncompatibleProof {
        entry_point: String,
        expected: usize,
        actual: usize,
    },
    #[error("upstream returned {status}: {detail}")]
    Upstream { status: u16, detail: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("serde error: {0}")]
    Serde(String),
}

impl ClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Validation(_) => "validation",
            ClientError::MissingFields { .. } => "missing_fields",
            ClientError::Encoding(_) => "encoding",
            ClientError::InsufficientBalance { .. } => "insufficient_balance",
            ClientError::AlreadySpent { .. } => "already_spent",
            ClientError::DuplicateCommitment(_) => "duplicate_commitment",
            ClientError::NoteNotFound(_) => "note_not_found",
            ClientError::ProofGeneration(_) => "proof_generation",
            ClientError::MalformedProofResponse(_) => "malformed_proof_response",
            ClientError::IncompatibleProof { .. } => "incompatible_proof",
            ClientError::Upstream { .. } => "upstream",
            ClientError::Transport(_) => "transport",
            ClientError::Rpc(_) => "rpc",
            ClientError::Persistence(_) => "persistence",
            ClientError::Crypto(_) => "crypto",
            ClientError::Serde(_) => "serde",
        }
    }

    /// Boundary failures worth another attempt. Client errors from upstream (4xx) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::Rpc(_) => true,
            ClientError::Upstream { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<ProverError> for ClientError {
    fn from(err: ProverError) -> Self {
        match err {
            ProverError::Rejected { status, message } => {
                ClientError::ProofGeneration(format!("prover returned {status}: {message}"))
            }
            ProverError::Transport(msg) => ClientError::Transport(msg),
            ProverError::Json(msg) => ClientError::MalformedProofResponse(msg),
            ProverError::InvalidInput(msg) => ClientError::Validation(msg),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serde(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Serde(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        ClientError::Validation(format!("config: {err}"))
    }
}
