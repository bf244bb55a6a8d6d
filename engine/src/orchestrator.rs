//! One divination request, end to end.
//!
//! ```text
//! resolve ─▶ look up texts ─▶ charge ─▶ generate ─┬─▶ text, then close ─▶ archive + count + usage
//!                                                 ├─▶ nothing / early error ─▶ refund + error
//!                                                 ├─▶ text, then error ─▶ archive partial + error
//!                                                 └─▶ caller gone ─▶ archive what arrived
//! ```
//!
//! Input, reference-data and entitlement failures are returned from
//! [`DivinationOrchestrator::handle`] before anything is charged. Once the
//! charge succeeds every later failure is reported in-band on the stream.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use yijing_providers::{Generation, TextGenerator};
use yijing_store::{Database, NewReading};
use yijing_types::{
    ClientContext, ConsumeOutcome, ConsumeRejection, Consumption, HexagramCode, HexagramContext,
    HexagramFigure, Question, ReadingId, UserId, UserName,
};

use crate::collaborators::{HexagramTexts, ReadingArchive, WalletLedger};
use crate::errors::{DivinationError, FailureReason};
use crate::prompt::{DEFAULT_SYSTEM_PROMPT, PromptInputs, build_user_prompt};
use crate::reply::{DivinationOutcome, DivinationStream, ReplyEvent};

/// Reply events buffered ahead of a slow caller.
const REPLY_CHANNEL_CAPACITY: usize = 32;

/// Run a synchronous storage call on the blocking pool.
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("storage task failed: {e}"))?
}

#[derive(Debug, Clone)]
pub struct DivinationRequest {
    pub user: UserId,
    /// Raw throw values, bottom line first.
    pub throws: Vec<i64>,
    pub question: String,
    pub user_name: Option<String>,
    pub client: Option<ClientContext>,
    /// The caller just watched a rewarded ad; an empty wallet does not block.
    pub ad_session_verified: bool,
}

impl DivinationRequest {
    #[must_use]
    pub fn new(user: UserId, throws: Vec<i64>, question: impl Into<String>) -> Self {
        Self {
            user,
            throws,
            question: question.into(),
            user_name: None,
            client: None,
            ad_session_verified: false,
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_client(mut self, client: ClientContext) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_ad_session(mut self, verified: bool) -> Self {
        self.ad_session_verified = verified;
        self
    }
}

struct Collaborators {
    ledger: Arc<dyn WalletLedger>,
    texts: Arc<dyn HexagramTexts>,
    archive: Arc<dyn ReadingArchive>,
    generator: Arc<dyn TextGenerator>,
    system_prompt: String,
}

#[derive(Clone)]
pub struct DivinationOrchestrator {
    inner: Arc<Collaborators>,
}

impl std::fmt::Debug for DivinationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DivinationOrchestrator").finish_non_exhaustive()
    }
}

impl DivinationOrchestrator {
    pub fn new(
        ledger: Arc<dyn WalletLedger>,
        texts: Arc<dyn HexagramTexts>,
        archive: Arc<dyn ReadingArchive>,
        generator: Arc<dyn TextGenerator>,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Collaborators {
                ledger,
                texts,
                archive,
                generator,
                system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            }),
        }
    }

    /// Everything backed by one SQLite database.
    pub fn with_database(
        db: Arc<Database>,
        generator: Arc<dyn TextGenerator>,
        system_prompt: Option<String>,
    ) -> Self {
        Self::new(db.clone(), db.clone(), db, generator, system_prompt)
    }

    /// Resolve and look up a hexagram without charging anyone.
    pub async fn context(&self, throws: &[i64]) -> Result<HexagramContext, DivinationError> {
        let figure = HexagramFigure::resolve_values(throws)?;
        self.lookup(figure).await
    }

    async fn lookup(&self, figure: HexagramFigure) -> Result<HexagramContext, DivinationError> {
        let texts = Arc::clone(&self.inner.texts);
        let code = figure.code().clone();
        let positions = figure.changing_positions().to_vec();

        let found = blocking(move || {
            let Some(record) = texts.lookup_hexagram(&code)? else {
                return Ok(None);
            };
            let lines = texts.lookup_line_texts(record.id, &positions)?;
            Ok(Some((record, lines)))
        })
        .await?;

        match found {
            Some((record, lines)) => Ok(HexagramContext::new(figure, record, lines)),
            None => {
                tracing::error!(code = %figure.code(), "Hexagram missing from reference texts");
                Err(DivinationError::HexagramNotFound {
                    code: figure.code().to_string(),
                })
            }
        }
    }

    /// Validate, charge, and start generating.
    pub async fn handle(
        &self,
        request: DivinationRequest,
    ) -> Result<DivinationStream, DivinationError> {
        let figure = HexagramFigure::resolve_values(&request.throws)?;
        let question = Question::new(&request.question)?;
        let user_name = UserName::parse(request.user_name.as_deref())?;
        let context = self.lookup(figure).await?;

        let charge = self.charge(&request.user, request.ad_session_verified).await?;

        let user_prompt = build_user_prompt(
            &context,
            PromptInputs {
                question: &question,
                user_name: user_name.as_ref(),
                client: request.client.as_ref(),
            },
        );
        tracing::info!(
            user_id = %request.user,
            code = %context.code(),
            charge = charge.as_ref().map_or("none", Consumption::kind),
            client = request.client.as_ref().map(|c| c.app.as_str()),
            "Starting divination"
        );
        let generation = self
            .inner
            .generator
            .generate(&self.inner.system_prompt, &user_prompt);

        let job = Job {
            collaborators: Arc::clone(&self.inner),
            user: request.user,
            question: question.into(),
            code: context.code().clone(),
            changing_lines: context.changing_positions().to_vec(),
            charge,
        };
        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let driver = tokio::spawn(job.run(generation, tx));
        Ok(DivinationStream::new(context, charge, rx, driver))
    }

    async fn charge(
        &self,
        user: &UserId,
        ad_session_verified: bool,
    ) -> Result<Option<Consumption>, DivinationError> {
        let ledger = Arc::clone(&self.inner.ledger);
        let owner = user.clone();
        let outcome = blocking(move || ledger.try_consume(&owner)).await?;

        match outcome {
            ConsumeOutcome::Charged(consumption) => Ok(Some(consumption)),
            ConsumeOutcome::Rejected(ConsumeRejection::NoCoins) if ad_session_verified => {
                tracing::info!(user_id = %user, "Empty wallet, proceeding on ad session");
                Ok(None)
            }
            ConsumeOutcome::Rejected(rejection) => {
                tracing::info!(user_id = %user, rejection = rejection.as_str(), "Divination rejected");
                Err(rejection.into())
            }
        }
    }
}

// ============================================================================
// Stream driver
// ============================================================================

struct Job {
    collaborators: Arc<Collaborators>,
    user: UserId,
    question: String,
    code: HexagramCode,
    changing_lines: Vec<u8>,
    charge: Option<Consumption>,
}

impl Job {
    async fn run(
        self,
        mut generation: Generation,
        tx: mpsc::Sender<ReplyEvent>,
    ) -> DivinationOutcome {
        let mut text = String::new();

        loop {
            let chunk = tokio::select! {
                biased;
                () = tx.closed() => None,
                chunk = generation.next_chunk() => Some(chunk),
            };
            match chunk {
                Some(Some(chunk)) => {
                    text.push_str(&chunk);
                    if tx.send(ReplyEvent::Text(chunk)).await.is_err() {
                        return self.cancelled(generation, &text).await;
                    }
                }
                Some(None) => break,
                None => return self.cancelled(generation, &text).await,
            }
        }

        let content = text.trim();
        match generation.finish().await {
            Ok(report) if !content.is_empty() => {
                let reading_id = self.persist(content).await;
                self.count_completed().await;
                tracing::info!(
                    user_id = %self.user,
                    model = %report.model,
                    finish_reason = report.finish_reason.as_ref().map(|r| r.as_str()),
                    reading_id = reading_id.map(ReadingId::value),
                    "Divination completed"
                );
                if report.usage.is_some() {
                    let _ = tx.send(ReplyEvent::Usage(report.clone())).await;
                }
                DivinationOutcome::Completed { reading_id, report }
            }
            Ok(report) => {
                tracing::warn!(user_id = %self.user, model = %report.model, "Empty response");
                self.fail(FailureReason::EmptyResponse, &tx).await
            }
            // Anything forwarded to the caller, even whitespace, keeps the charge.
            Err(e) if text.is_empty() => {
                tracing::warn!(user_id = %self.user, error = %e, "Generation failed before any text");
                self.fail(FailureReason::Upstream(e.to_string()), &tx).await
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user,
                    error = %e,
                    delivered_chars = text.chars().count(),
                    "Generation failed mid-stream; keeping partial text"
                );
                let reading_id = if content.is_empty() {
                    None
                } else {
                    self.persist(content).await
                };
                let error = e.to_string();
                let _ = tx
                    .send(ReplyEvent::Failed(FailureReason::Upstream(error.clone())))
                    .await;
                DivinationOutcome::Partial { reading_id, error }
            }
        }
    }

    async fn cancelled(&self, generation: Generation, text: &str) -> DivinationOutcome {
        drop(generation);
        let content = text.trim();
        tracing::info!(
            user_id = %self.user,
            delivered_chars = content.chars().count(),
            "Caller disconnected; generation cancelled"
        );
        let reading_id = if content.is_empty() {
            None
        } else {
            self.persist(content).await
        };
        DivinationOutcome::Cancelled { reading_id }
    }

    async fn fail(&self, reason: FailureReason, tx: &mpsc::Sender<ReplyEvent>) -> DivinationOutcome {
        let refunded = self.refund().await;
        let _ = tx.send(ReplyEvent::Failed(reason.clone())).await;
        DivinationOutcome::Failed { reason, refunded }
    }

    async fn refund(&self) -> bool {
        let Some(consumption) = self.charge else {
            return false;
        };
        let ledger = Arc::clone(&self.collaborators.ledger);
        let user = self.user.clone();
        match blocking(move || ledger.refund(&user, &consumption)).await {
            Ok(refunded) => {
                tracing::info!(
                    user_id = %self.user,
                    charge = consumption.kind(),
                    refunded,
                    "Reconciled charge"
                );
                refunded
            }
            Err(e) => {
                tracing::error!(user_id = %self.user, error = %e, "Refund failed");
                false
            }
        }
    }

    /// Best effort: failures are logged and swallowed.
    async fn persist(&self, content: &str) -> Option<ReadingId> {
        let archive = Arc::clone(&self.collaborators.archive);
        let reading = NewReading {
            user: self.user.clone(),
            question: self.question.clone(),
            code: self.code.clone(),
            changing_lines: self.changing_lines.clone(),
            content: content.to_string(),
            derived_from: None,
        };
        match blocking(move || archive.record_reading(&reading)).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(user_id = %self.user, error = %e, "Failed to archive reading");
                None
            }
        }
    }

    async fn count_completed(&self) {
        let ledger = Arc::clone(&self.collaborators.ledger);
        let user = self.user.clone();
        if let Err(e) = blocking(move || ledger.record_completed_request(&user)).await {
            tracing::warn!(user_id = %self.user, error = %e, "Failed to bump request count");
        }
    }
}
