use std::path::PathBuf;

/// Errors surfaced to whoever drives the provisioning wizard.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Received invalid OAuth code. Please try again.")]
    InvalidAuthorizationCode,

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Pairing request failed: {0}")]
    Pairing(String),

    #[error("Could not connect to bridge: {0}")]
    Connection(String),

    #[error("Unexpected response from bridge: {0}")]
    Protocol(String),

    #[error("Stored private key is unreadable: {0}")]
    KeyParse(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Not ready: {0}")]
    NotReady(&'static str),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether resubmitting the same step can succeed without manual intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidAuthorizationCode
                | Self::TokenExchange(_)
                | Self::Pairing(_)
                | Self::Connection(_)
        )
    }

    /// Guidance for the operator, shown next to the error message.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::InvalidAuthorizationCode => {
                "Paste the full URL of the page you were redirected to after logging in."
            }
            Self::TokenExchange(_) => {
                "Authorization codes are single use. Log in again to generate a new code."
            }
            Self::Pairing(_) => "The pairing service returned an unexpected answer. Try again.",
            Self::Connection(_) => "Check the bridge IP address and try again.",
            Self::Protocol(_) => {
                "The bridge firmware may be incompatible. Check the logs before retrying."
            }
            Self::KeyParse(_) => "Reset the certificate files and start over.",
            Self::Certificate(_) => "Reset the certificate files and start over.",
            Self::Config(_) => "Check the configuration file.",
            Self::NotReady(_) => "Complete the previous step first.",
            Self::Io { .. } => "Check that the certificate directory is writable.",
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
