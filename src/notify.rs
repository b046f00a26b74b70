// =============================================================================
// Notification Sink — critical alerts out of the engine
// =============================================================================
//
// Delivery is an external concern; the engine only needs a sink. The default
// sink is the structured log. A webhook sink posts the same payload to a
// configured URL, fire-and-forget, so a slow endpoint can never stall the
// trading thread.
// =============================================================================

use serde::Serialize;
use tracing::{error, info, warn};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Where alerts go. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, code: &str, message: &str);
}

/// Default sink: the structured log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, severity: Severity, code: &str, message: &str) {
        match severity {
            Severity::Info => info!(code, "{message}"),
            Severity::Warning => warn!(code, "{message}"),
            Severity::Critical => error!(code, "{message}"),
        }
    }
}

/// Webhook sink: POSTs the alert as JSON, fire-and-forget.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct AlertPayload {
    severity: String,
    code: String,
    message: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, severity: Severity, code: &str, message: &str) {
        // Mirror to the log regardless; the webhook is best-effort.
        LogNotifier.notify(severity, code, message);

        let payload = AlertPayload {
            severity: severity.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        let request = self.http.post(&self.url).json(&payload);
        tokio::spawn(async move {
            if let Err(e) = request.send().await {
                warn!(error = %e, "notification webhook delivery failed");
            }
        });
    }
}
