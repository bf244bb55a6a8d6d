//! The handle a caller holds while text is being generated.

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yijing_types::GenerationReport;

/// Chunks buffered between the transport task and the consumer.
pub const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// Why one candidate model was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub model: String,
    pub attempts: u32,
    pub message: String,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (after {} attempt{}): {}",
            self.model,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.message
        )
    }
}

fn join_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Every candidate model failed before a stream was established.
    #[error("all models failed: {}", join_failures(.failures))]
    Exhausted { failures: Vec<CandidateFailure> },
    /// The stream broke after it was established.
    #[error("{model}: {message}")]
    Stream { model: String, message: String },
    /// Nobody is reading the chunks any more.
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation task failed: {0}")]
    Task(String),
}

impl GenerationError {
    /// The model that produced output before failing, if any.
    #[must_use]
    pub fn streaming_model(&self) -> Option<&str> {
        match self {
            Self::Stream { model, .. } => Some(model),
            _ => None,
        }
    }
}

/// A running generation: a lazy sequence of text chunks plus a completion
/// handle carrying the final usage/finish snapshot.
///
/// Dropping the handle aborts the transport task.
pub struct Generation {
    chunks: mpsc::Receiver<String>,
    task: Option<JoinHandle<Result<GenerationReport, GenerationError>>>,
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("running", &self.task.as_ref().is_some_and(|t| !t.is_finished()))
            .finish_non_exhaustive()
    }
}

impl Generation {
    /// Run `produce` on the tokio runtime; every string it sends becomes a chunk.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(produce: F) -> Self
    where
        F: FnOnce(mpsc::Sender<String>) -> Fut,
        Fut: Future<Output = Result<GenerationReport, GenerationError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let task = tokio::spawn(produce(tx));
        Self {
            chunks: rx,
            task: Some(task),
        }
    }

    /// Next text chunk. `None` once the producer has stopped sending.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Wait for the producer's verdict. Call after [`Self::next_chunk`] returned `None`;
    /// any chunks still buffered are discarded.
    pub async fn finish(mut self) -> Result<GenerationReport, GenerationError> {
        self.chunks.close();
        let Some(task) = self.task.take() else {
            return Err(GenerationError::Task("completion already taken".to_string()));
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(GenerationError::Cancelled),
            Err(e) => Err(GenerationError::Task(e.to_string())),
        }
    }

    /// Stop the transport task without waiting for it.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Something that can stream text for a system + user prompt pair.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, system_prompt: &str, user_prompt: &str) -> Generation;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_then_report() {
        let mut generation = Generation::spawn(|tx| async move {
            for part in ["a", "b"] {
                tx.send(part.to_string())
                    .await
                    .map_err(|_| GenerationError::Cancelled)?;
            }
            Ok(GenerationReport::new("m"))
        });

        let mut got = Vec::new();
        while let Some(chunk) = generation.next_chunk().await {
            got.push(chunk);
        }
        assert_eq!(got, vec!["a", "b"]);
        assert_eq!(generation.finish().await.unwrap().model, "m");
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_producer() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let generation = Generation::spawn(|_tx| async move {
            let _guard = done_tx;
            std::future::pending::<()>().await;
            Ok(GenerationReport::new("never"))
        });
        drop(generation);
        // The oneshot sender is dropped when the aborted task is torn down.
        assert!(done_rx.await.is_err());
    }

    #[test]
    fn exhausted_message_lists_every_candidate() {
        let err = GenerationError::Exhausted {
            failures: vec![
                CandidateFailure {
                    model: "a".into(),
                    attempts: 1,
                    message: "HTTP 401".into(),
                },
                CandidateFailure {
                    model: "b".into(),
                    attempts: 3,
                    message: "HTTP 503".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "all models failed: a (after 1 attempt): HTTP 401; b (after 3 attempts): HTTP 503"
        );
    }
}
