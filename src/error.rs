use thiserror::Error;

pub type Result<T> = std::result::Result<T, KmsError>;

#[derive(Debug, Error)]
pub enum KmsError {
    /// The option is not present in the configuration map. Callers use
    /// this to decide between "apply default" and "fail".
    #[error("configuration option not set: {0}")]
    ConfigOptionMissing(String),

    /// The option is present but has the wrong type or an unparsable value.
    #[error("configuration option not valid: {key}: {reason}")]
    ConfigOptionInvalid { key: String, reason: String },

    #[error("KMS does not support access to user provided secret")]
    GetSecretUnsupported,

    #[error("integrated DEK stores do not allow GetSecret")]
    GetSecretIntegrated,

    /// Every key-derivation, random-source, AEAD and envelope failure ends
    /// up here, without detail about the failing step.
    #[error("cannot process DEK")]
    CannotProcessDek,

    #[error("{operation} failed{}: {message}", fmt_code(.code))]
    Remote {
        operation: String,
        code: Option<String>,
        message: String,
    },

    #[error("{kind} {namespace}/{name} not found")]
    ClusterNotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("cluster API: {0}")]
    Cluster(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    Config(String),

    #[error("TLS: {0}")]
    Tls(String),

    #[error("KMIP: {0}")]
    Ttlv(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn fmt_code(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl KmsError {
    pub fn missing(key: impl Into<String>) -> Self {
        KmsError::ConfigOptionMissing(key.into())
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        KmsError::ConfigOptionInvalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn remote(operation: impl Into<String>, code: Option<String>, message: impl Into<String>) -> Self {
        KmsError::Remote {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }

    pub fn is_config_missing(&self) -> bool {
        matches!(self, KmsError::ConfigOptionMissing(_))
    }

    pub fn is_config_invalid(&self) -> bool {
        matches!(self, KmsError::ConfigOptionInvalid { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KmsError::ClusterNotFound { .. })
    }

    /// Prefix the message with context, keeping the sentinel variants
    /// intact so callers can still match on them.
    pub(crate) fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            KmsError::Config(msg) => KmsError::Config(format!("{ctx}: {msg}")),
            KmsError::Cluster(msg) => KmsError::Cluster(format!("{ctx}: {msg}")),
            KmsError::Remote {
                operation,
                code,
                message,
            } => KmsError::Remote {
                operation: format!("{ctx}: {operation}"),
                code,
                message,
            },
            other => other,
        }
    }
}

impl From<ureq::Error> for KmsError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, resp) => {
                let url = resp.get_url().to_owned();
                let body = resp.into_string().unwrap_or_default();
                KmsError::remote(url, Some(code.to_string()), body)
            }
            ureq::Error::Transport(t) => {
                let timed_out = std::error::Error::source(&t)
                    .and_then(|s| s.downcast_ref::<std::io::Error>())
                    .is_some_and(|io| {
                        matches!(
                            io.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        )
                    });
                if timed_out {
                    KmsError::DeadlineExceeded
                } else {
                    KmsError::remote("HTTP request", None, t.to_string())
                }
            }
        }
    }
}
