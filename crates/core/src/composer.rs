//! Assembles one full dialogue turn from the script engine and the two model
//! backends.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::backend::{SpeechSynthesisBackend, TextGenerationBackend};
use crate::error::Result;
use crate::registry::SpeakerSessionRegistry;
use crate::script::DialogScriptEngine;

/// Everything one dialogue turn produces.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReply {
    /// Flattened synthesized audio samples.
    pub reply: Vec<f32>,
    pub reply_text: String,
    /// Id of the script node that fired, if any.
    pub script_triggered: Option<String>,
}

/// Turns one user utterance into a reply: scripted-line lookup, text
/// generation with the scripted line as a hint, then speech synthesis.
pub struct ReplyComposer {
    registry: Arc<SpeakerSessionRegistry>,
    engine: Arc<DialogScriptEngine>,
    generation: Arc<dyn TextGenerationBackend>,
    synthesis: Arc<dyn SpeechSynthesisBackend>,
}

impl ReplyComposer {
    pub fn new(
        registry: Arc<SpeakerSessionRegistry>,
        engine: Arc<DialogScriptEngine>,
        generation: Arc<dyn TextGenerationBackend>,
        synthesis: Arc<dyn SpeechSynthesisBackend>,
    ) -> Self {
        Self {
            registry,
            engine,
            generation,
            synthesis,
        }
    }

    /// Runs one dialogue turn for a speaker.
    ///
    /// Holds the speaker's write gate for the whole turn, so steps for the
    /// same speaker serialize while other speakers proceed. Script matching
    /// never fails a turn; a generation or synthesis failure does.
    #[instrument(skip(self, line))]
    pub async fn step_dialog(&self, speaker_id: &str, line: &str) -> Result<StepReply> {
        let _profile = self.registry.guard(speaker_id).await?;

        let scripted = self.engine.step(speaker_id, line).await?;
        let hint = scripted.as_ref().map(|m| m.line.as_str());
        let reply_text = self.generation.step_dialog(speaker_id, line, hint).await?;
        let reply = self.synthesis.tts(speaker_id, &reply_text).await?;

        let script_triggered = scripted.map(|m| m.node_id);
        debug!(
            script = script_triggered.as_deref(),
            samples = reply.len(),
            "dialogue turn composed"
        );
        Ok(StepReply {
            reply,
            reply_text,
            script_triggered,
        })
    }
}
