//! What the caller of a divination receives: a stream of reply events and,
//! once it ends, the outcome of the whole request.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yijing_types::{Consumption, GenerationReport, HexagramContext, ReadingId};

use crate::errors::{DivinationError, FailureReason};

/// Prefix of the trailing usage marker in rendered output.
pub const TOKEN_USAGE_MARKER: &str = "\n[[[TOKEN_USAGE]]]";
pub const UPSTREAM_ERROR_MARKER: &str = "\n[llm_unavailable]";
pub const EMPTY_RESPONSE_MARKER: &str = "\n[empty_response]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// Generated text, forwarded as soon as it arrives.
    Text(String),
    /// Final usage snapshot after a successful reading.
    Usage(GenerationReport),
    /// Terminal failure; no further events follow.
    Failed(FailureReason),
}

impl ReplyEvent {
    /// Plain-text wire form.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Usage(report) => format!(
                "{TOKEN_USAGE_MARKER}{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            ),
            Self::Failed(FailureReason::EmptyResponse) => EMPTY_RESPONSE_MARKER.to_string(),
            Self::Failed(FailureReason::Upstream(message)) => {
                format!("{UPSTREAM_ERROR_MARKER} {message}")
            }
        }
    }
}

/// How a request ended, after all ledger and archive side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DivinationOutcome {
    /// Non-empty text. `reading_id` is `None` if persisting failed.
    Completed {
        reading_id: Option<ReadingId>,
        report: GenerationReport,
    },
    /// Text was delivered before the backend failed; kept, not refunded.
    Partial {
        reading_id: Option<ReadingId>,
        error: String,
    },
    /// Nothing was delivered. `refunded` is `false` for quota or uncharged requests.
    Failed {
        reason: FailureReason,
        refunded: bool,
    },
    /// The caller went away mid-stream. Never refunded.
    Cancelled { reading_id: Option<ReadingId> },
}

impl DivinationOutcome {
    #[must_use]
    pub fn reading_id(&self) -> Option<ReadingId> {
        match self {
            Self::Completed { reading_id, .. }
            | Self::Partial { reading_id, .. }
            | Self::Cancelled { reading_id } => *reading_id,
            Self::Failed { .. } => None,
        }
    }
}

/// Result of draining a [`DivinationStream`] without streaming it anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    pub text: String,
    pub outcome: DivinationOutcome,
}

impl Collected {
    #[must_use]
    pub fn report(&self) -> Option<&GenerationReport> {
        match &self.outcome {
            DivinationOutcome::Completed { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// A running divination.
///
/// Dropping the stream before it ends counts as a disconnect: generation is
/// cancelled, nothing is refunded, and any text already produced is archived.
#[derive(Debug)]
pub struct DivinationStream {
    context: HexagramContext,
    charge: Option<Consumption>,
    events: mpsc::Receiver<ReplyEvent>,
    driver: JoinHandle<DivinationOutcome>,
}

impl DivinationStream {
    pub(crate) fn new(
        context: HexagramContext,
        charge: Option<Consumption>,
        events: mpsc::Receiver<ReplyEvent>,
        driver: JoinHandle<DivinationOutcome>,
    ) -> Self {
        Self {
            context,
            charge,
            events,
            driver,
        }
    }

    #[must_use]
    pub fn context(&self) -> &HexagramContext {
        &self.context
    }

    /// What was taken from the wallet; `None` for an ad-session override.
    #[must_use]
    pub fn charge(&self) -> Option<&Consumption> {
        self.charge.as_ref()
    }

    pub async fn next_event(&mut self) -> Option<ReplyEvent> {
        self.events.recv().await
    }

    /// Discard any unread events and wait for the outcome.
    pub async fn finish(mut self) -> Result<DivinationOutcome, DivinationError> {
        while self.events.recv().await.is_some() {}
        self.outcome().await
    }

    /// Drain the stream for callers that want the whole text at once.
    ///
    /// A request that delivered nothing becomes [`DivinationError::Generation`].
    pub async fn collect(mut self) -> Result<Collected, DivinationError> {
        let mut text = String::new();
        while let Some(event) = self.events.recv().await {
            if let ReplyEvent::Text(chunk) = event {
                text.push_str(&chunk);
            }
        }
        match self.outcome().await? {
            DivinationOutcome::Failed { reason, .. } => Err(DivinationError::Generation(reason)),
            outcome => Ok(Collected {
                text: text.trim().to_string(),
                outcome,
            }),
        }
    }

    /// Disconnect on purpose and wait until the partial text is archived.
    pub async fn cancel(self) -> Result<DivinationOutcome, DivinationError> {
        let Self { events, driver, .. } = self;
        drop(events);
        Self::join(driver).await
    }

    async fn outcome(self) -> Result<DivinationOutcome, DivinationError> {
        Self::join(self.driver).await
    }

    async fn join(
        driver: JoinHandle<DivinationOutcome>,
    ) -> Result<DivinationOutcome, DivinationError> {
        driver
            .await
            .map_err(|e| DivinationError::Internal(anyhow::anyhow!("divination task failed: {e}")))
    }
}
