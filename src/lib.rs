//! NPC dialogue service core: one command dispatcher over pluggable
//! inference backends.
//!
//! This crate re-exports the embedding-facing API of `npc-dialogue-core`.
//! Build a [`CommandDispatcher`] over your backend implementations (or the
//! bundled development backends) and feed it JSON requests:
//!
//! ```no_run
//! use std::sync::Arc;
//! use npc_dialogue::{CommandDispatcher, EchoGeneration, LexicalSimilarity, ToneSynthesis};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = CommandDispatcher::new(
//!     Arc::new(LexicalSimilarity::new()),
//!     Arc::new(EchoGeneration::default()),
//!     Arc::new(ToneSynthesis::default()),
//! );
//! let response = dispatcher
//!     .handle_text(r#"{ "cmd": "create_speaker", "speaker_id": "guard_17",
//!                       "persona": "a gruff city guard", "temperature": 0.7,
//!                       "traits": ["3"] }"#)
//!     .await;
//! # let _ = response;
//! # }
//! ```

pub use npc_dialogue_core::backend::{
    EchoGeneration, LexicalSimilarity, SimilarityBackend, SpeechSynthesisBackend,
    TextGenerationBackend, ToneSynthesis,
};
pub use npc_dialogue_core::composer::{ReplyComposer, StepReply};
pub use npc_dialogue_core::dispatch::CommandDispatcher;
pub use npc_dialogue_core::error::DialogueError;
pub use npc_dialogue_core::message::{Request, Response, request_templates, status};
pub use npc_dialogue_core::registry::{SpeakerProfile, SpeakerSessionRegistry};
pub use npc_dialogue_core::script::{DialogScriptEngine, ScriptMatch, ScriptNode, SessionState};
