use std::fmt;

#[derive(Debug)]
pub enum ProverError {
    Transport(String),
    Rejected { status: u16, message: String },
    Json(String),
    InvalidInput(String),
}

impl ProverError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProverError::Transport(msg) if msg.contains("timed out"))
    }
}

impl fmt::Display for ProverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProverError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProverError::Rejected { status, message } => {
                write!(f, "prover rejected request ({status}): {message}")
            }
            ProverError::Json(msg) => write!(f, "json error: {msg}"),
            ProverError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for ProverError {}

impl From<serde_json::Error> for ProverError {
    fn from(err: serde_json::Error) -> Self {
        ProverError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for ProverError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProverError::Transport(format!("request timed out: {err}"))
        } else if err.is_decode() {
            ProverError::Json(err.to_string())
        } else {
            ProverError::Transport(err.to_string())
        }
    }
}
