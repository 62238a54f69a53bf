/// Errors from a provider call, classified by whether retrying can help.
///
/// Quota, authentication and invalid-parameter responses are permanent.
/// Network failures, timeouts, `408`, `429` and `5xx` are transient. A
/// transient error never turns into a failed job on its own; the engine
/// retries it within its budget.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Transient provider error{}: {message}", status_suffix(*status))]
    Transient { status: Option<u16>, message: String },

    #[error("Provider rejected request{}: {message}", status_suffix(*status))]
    Permanent { status: Option<u16>, message: String },
}

fn status_suffix(status: Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_retryable_status(status) {
            ProviderError::Transient {
                status: Some(status),
                message,
            }
        } else {
            ProviderError::Permanent {
                status: Some(status),
                message,
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Transient { status, .. } | ProviderError::Permanent { status, .. } => {
                *status
            }
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Transient { message, .. } | ProviderError::Permanent { message, .. } => {
                message
            }
        }
    }
}

/// `408`, `429` and every `5xx`.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ProviderError::from_status(status.as_u16(), e.to_string());
        }
        if e.is_builder() {
            return ProviderError::permanent(format!("invalid request: {e}"));
        }
        // Connect, timeout, body and decode failures.
        ProviderError::transient(e.to_string())
    }
}
