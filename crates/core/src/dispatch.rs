//! Validates inbound requests and routes them to the registry and composer.
//!
//! This is the only externally visible entry point. Every request produces a
//! response; domain and collaborator failures are logged here and mapped to
//! their wire status, so one bad request never takes the service down.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::backend::{SimilarityBackend, SpeechSynthesisBackend, TextGenerationBackend};
use crate::composer::{ReplyComposer, StepReply};
use crate::error::{DialogueError, Result};
use crate::message::{self, Request, Response};
use crate::registry::SpeakerSessionRegistry;
use crate::script::{DialogScriptEngine, ScriptNode};

/// One dispatcher per service instance, shared across request handlers.
pub struct CommandDispatcher {
    registry: Arc<SpeakerSessionRegistry>,
    engine: Arc<DialogScriptEngine>,
    composer: ReplyComposer,
}

impl CommandDispatcher {
    /// Wires the script engine, registry, and composer over one set of
    /// collaborator backends.
    pub fn new(
        similarity: Arc<dyn SimilarityBackend>,
        generation: Arc<dyn TextGenerationBackend>,
        synthesis: Arc<dyn SpeechSynthesisBackend>,
    ) -> Self {
        let engine = Arc::new(DialogScriptEngine::new(similarity));
        let registry = Arc::new(SpeakerSessionRegistry::new(
            Arc::clone(&generation),
            Arc::clone(&synthesis),
            Arc::clone(&engine),
        ));
        let composer = ReplyComposer::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
            generation,
            synthesis,
        );
        Self {
            registry,
            engine,
            composer,
        }
    }

    /// Handles one JSON request, always producing a response.
    pub async fn handle(&self, request: Value) -> Response {
        match self.route(request).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    DialogueError::Backend(source) => {
                        error!(error = %source, "request failed in a collaborator backend");
                    }
                    other => debug!(error = %other, "request rejected"),
                }
                Response::failure(&err)
            }
        }
    }

    /// Convenience wrapper for transports that deliver raw text frames.
    pub async fn handle_text(&self, raw: &str) -> Response {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.handle(value).await,
            Err(err) => {
                let err =
                    DialogueError::InvalidMessage(format!("request is not valid JSON: {err}"));
                debug!(error = %err, "request rejected");
                Response::failure(&err)
            }
        }
    }

    async fn route(&self, request: Value) -> Result<Response> {
        match message::parse_request(&request)? {
            Request::CreateSpeaker {
                speaker_id,
                persona,
                temperature,
                traits,
            } => {
                self.registry
                    .create(&speaker_id, &persona, temperature, &traits)
                    .await?;
                Ok(Response::ok())
            }
            Request::StepDialog { speaker_id, line } => {
                let StepReply {
                    reply,
                    reply_text,
                    script_triggered,
                } = self.composer.step_dialog(&speaker_id, &line).await?;
                Ok(Response::step(reply, reply_text, script_triggered))
            }
            Request::ScriptLine {
                speaker_id,
                parent,
                node_id,
                cue_lines,
                script_lines,
                expires_after,
                threshold,
            } => {
                let node = ScriptNode {
                    node_id,
                    parent_id: parent,
                    cue_lines,
                    script_lines,
                    expires_after,
                    threshold,
                };
                self.registry.script_line(&speaker_id, node).await?;
                Ok(Response::ok())
            }
            Request::DeleteSpeaker { speaker_id } => {
                self.registry.delete(&speaker_id).await?;
                Ok(Response::ok())
            }
            Request::EndDialog { speaker_id } => {
                self.registry.reset(&speaker_id).await?;
                Ok(Response::ok())
            }
        }
    }

    /// The registry backing this dispatcher, for embedding applications that
    /// want direct introspection.
    pub fn registry(&self) -> &Arc<SpeakerSessionRegistry> {
        &self.registry
    }

    /// The script engine backing this dispatcher.
    pub fn engine(&self) -> &Arc<DialogScriptEngine> {
        &self.engine
    }
}
