use std::time::Duration;
use thiserror::Error;

/// Stage of a stream probe, used to explain why a channel failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProbeStage {
    /// URL could not be parsed or has no host
    UrlParsing,
    /// TCP connection to the stream host failed
    TcpConnection,
    /// HTTP request failed or returned a rejected status
    HttpRequest,
    /// RTSP OPTIONS handshake failed
    RtspHandshake,
    /// Local file is missing
    FileCheck,
    /// URL scheme is not something we know how to probe
    UnsupportedScheme,
}

impl std::fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl ProbeStage {
    /// Get a user-friendly name for the stage
    pub fn display_name(&self) -> &'static str {
        match self {
            ProbeStage::UrlParsing => "URL Parsing",
            ProbeStage::TcpConnection => "TCP Connection",
            ProbeStage::HttpRequest => "HTTP Request",
            ProbeStage::RtspHandshake => "RTSP Handshake",
            ProbeStage::FileCheck => "File Check",
            ProbeStage::UnsupportedScheme => "Unsupported Scheme",
        }
    }

    /// Get actionable suggestion for fixing the issue at this stage
    pub fn suggestion(&self) -> &'static str {
        match self {
            ProbeStage::UrlParsing => "The stream URL is malformed. Check for typos or stray characters.",
            ProbeStage::TcpConnection => {
                "Host is offline or blocking connections. Try a backup URL for this channel."
            }
            ProbeStage::HttpRequest => {
                "Server answered but rejected the stream. The link may have expired."
            }
            ProbeStage::RtspHandshake => {
                "Host accepted the connection but did not speak RTSP. Check the port."
            }
            ProbeStage::FileCheck => "The local file was moved or deleted.",
            ProbeStage::UnsupportedScheme => {
                "Only http, https, rtmp, rtmps, rtsp and file URLs can be checked."
            }
        }
    }
}

/// Error type for playlist, EPG and schedule operations
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input text could not be understood
    #[error("Failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A time slot would overlap an existing one
    #[error("Time slot {start} - {end} conflicts with {count} existing slot(s)")]
    Conflict {
        start: String,
        end: String,
        count: usize,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MatrixError {
    pub fn parse(what: &'static str, reason: impl Into<String>) -> Self {
        MatrixError::Parse {
            what,
            reason: reason.into(),
        }
    }

    /// Get detailed diagnostic information about the error
    pub fn diagnostics(&self) -> String {
        match self {
            MatrixError::Io(e) => format!("I/O Error\nError: {}\nSuggestion: Check the path and permissions", e),
            MatrixError::Parse { what, reason } => {
                format!("Parse Error\nInput: {}\nReason: {}\nSuggestion: Verify the file format", what, reason)
            }
            MatrixError::Xml(reason) => {
                format!("XML Error\nReason: {}\nSuggestion: The EPG source may be truncated", reason)
            }
            MatrixError::Database(e) => {
                format!("Database Error\nError: {}\nSuggestion: Close other programs using the schedule database", e)
            }
            MatrixError::Conflict { start, end, count } => format!(
                "Schedule Conflict\nSlot: {} - {}\nOverlaps: {}\nSuggestion: Run conflict resolution or pick a free slot",
                start, end, count
            ),
            MatrixError::NotFound(what) => format!("Not Found\nItem: {}", what),
            MatrixError::Network(e) => format!("Network Error\nError: {}\nSuggestion: Check the URL and connection", e),
            MatrixError::InvalidInput(reason) => format!("Invalid Input\nReason: {}", reason),
            MatrixError::Serialization(e) => format!("Serialization Error\nError: {}", e),
        }
    }
}

pub type Result<T, E = MatrixError> = std::result::Result<T, E>;

/// Validation progress tracking
#[derive(Debug, Clone)]
pub struct ValidationProgress {
    pub checked: usize,
    pub total: usize,
    pub working: usize,
    pub eta: Option<Duration>,
}

impl ValidationProgress {
    pub fn new(checked: usize, total: usize, working: usize) -> Self {
        Self {
            checked,
            total,
            working,
            eta: None,
        }
    }

    pub fn with_eta(mut self, eta: Duration) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.checked >= self.total
    }

    pub fn to_message(&self) -> String {
        let progress = format!("[{}/{}]", self.checked, self.total);
        let eta = self.eta.as_ref().map(|d| format!(" ETA: {}s", d.as_secs())).unwrap_or_default();
        format!("Validating {} - {} working{}", progress, self.working, eta)
    }
}
