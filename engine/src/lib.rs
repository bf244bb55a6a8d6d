//! Divination pipeline for Yijing.
//!
//! [`DivinationOrchestrator`] composes the pieces: hexagram resolution,
//! the wallet ledger, the generation gateway and the reading archive. It
//! owns the reconciliation rules between them (charge up front, refund when
//! nothing was delivered, archive whatever was).

mod casting;
mod collaborators;
mod errors;
mod orchestrator;
mod prompt;
mod reply;

pub use casting::{YARROW_STALKS, cast_throws, cast_throws_with};
pub use collaborators::{HexagramTexts, ReadingArchive, WalletLedger};
pub use errors::{DivinationError, ErrorClass, FailureReason};
pub use orchestrator::{DivinationOrchestrator, DivinationRequest};
pub use prompt::{DEFAULT_SYSTEM_PROMPT, PromptInputs, build_user_prompt};
pub use reply::{
    Collected, DivinationOutcome, DivinationStream, EMPTY_RESPONSE_MARKER, ReplyEvent,
    TOKEN_USAGE_MARKER, UPSTREAM_ERROR_MARKER,
};

pub use yijing_providers::{self, Generation, GenerationError, TextGenerator};
pub use yijing_store::{self, Database};
pub use yijing_types;
