//! Speaker lifecycle: creation, deletion, and session reset across all
//! collaborator backends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{SpeechSynthesisBackend, TextGenerationBackend};
use crate::error::{DialogueError, Result};
use crate::script::{DialogScriptEngine, ScriptNode};

/// Attributes captured when a speaker is created.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerProfile {
    pub persona: String,
    pub temperature: f32,
    /// Synthesis voice, parsed from the first speaker trait (`0` fallback).
    pub voice_id: i64,
}

/// Owns speaker existence and runs every cross-backend lifecycle sequence.
///
/// Each speaker entry doubles as that speaker's write gate: a mutating
/// operation holds the entry's mutex for its full duration, so at most one
/// mutation per speaker is in flight while distinct speakers proceed in
/// parallel. The outer map lock is only held for insert/lookup/remove,
/// never across a backend call. Waiting on a busy gate can outlive the entry
/// itself, so a gate taken from the map is re-verified by identity once
/// locked before any state is touched.
pub struct SpeakerSessionRegistry {
    generation: Arc<dyn TextGenerationBackend>,
    synthesis: Arc<dyn SpeechSynthesisBackend>,
    engine: Arc<DialogScriptEngine>,
    speakers: RwLock<HashMap<String, Arc<Mutex<SpeakerProfile>>>>,
}

impl SpeakerSessionRegistry {
    pub fn new(
        generation: Arc<dyn TextGenerationBackend>,
        synthesis: Arc<dyn SpeechSynthesisBackend>,
        engine: Arc<DialogScriptEngine>,
    ) -> Self {
        Self {
            generation,
            synthesis,
            engine,
            speakers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a speaker with every backend: voice first, then the
    /// generation model, then a fresh script session.
    ///
    /// Re-creating an existing speaker re-runs the full sequence and replaces
    /// its script forest and session with empty ones. A failed first-time
    /// create leaves no trace in the registry; a failed re-create keeps the
    /// previous entry observable. A create that raced a delete for the same
    /// speaker starts over once the gate frees, so it lands strictly after
    /// the delete instead of straddling it.
    pub async fn create(
        &self,
        speaker_id: &str,
        persona: &str,
        temperature: f32,
        traits: &[String],
    ) -> Result<()> {
        let voice_id = derive_voice_id(speaker_id, traits);

        // Insert a reservation (or take the existing entry's gate), then lock
        // it. The entry can be deleted or replaced while we wait on a busy
        // gate; a stale gate restarts the sequence.
        let (gate, mut profile, fresh) = loop {
            let (gate, fresh) = {
                let mut speakers = self.speakers.write().await;
                match speakers.get(speaker_id) {
                    Some(gate) => (Arc::clone(gate), false),
                    None => {
                        let gate = Arc::new(Mutex::new(SpeakerProfile {
                            persona: persona.to_string(),
                            temperature,
                            voice_id,
                        }));
                        speakers.insert(speaker_id.to_string(), Arc::clone(&gate));
                        (gate, true)
                    }
                }
            };
            let profile = Arc::clone(&gate).lock_owned().await;
            if self.gate_is_live(speaker_id, &gate).await {
                break (gate, profile, fresh);
            }
        };

        match self.provision(speaker_id, persona, temperature, voice_id).await {
            Ok(()) => {
                *profile = SpeakerProfile {
                    persona: persona.to_string(),
                    temperature,
                    voice_id,
                };
                info!(speaker = speaker_id, voice_id, "speaker created");
                Ok(())
            }
            Err(err) => {
                // A failed first-time create must not leave the speaker
                // observable. Remove the reservation only if it is still ours.
                if fresh {
                    let mut speakers = self.speakers.write().await;
                    if speakers
                        .get(speaker_id)
                        .is_some_and(|live| Arc::ptr_eq(live, &gate))
                    {
                        speakers.remove(speaker_id);
                    }
                }
                Err(DialogueError::Backend(err))
            }
        }
    }

    async fn provision(
        &self,
        speaker_id: &str,
        persona: &str,
        temperature: f32,
        voice_id: i64,
    ) -> anyhow::Result<()> {
        self.synthesis.create_voice(speaker_id, voice_id).await?;
        self.generation
            .add_speaker(speaker_id, persona, temperature)
            .await?;
        self.engine.add_speaker(speaker_id).await;
        Ok(())
    }

    /// Removes a speaker everywhere. Deleting an unknown speaker succeeds
    /// without touching any backend.
    pub async fn delete(&self, speaker_id: &str) -> Result<()> {
        let Some(gate) = self.lookup_gate(speaker_id).await else {
            debug!(speaker = speaker_id, "delete for an unknown speaker, nothing to do");
            return Ok(());
        };
        let _profile = gate.lock().await;
        if !self.gate_is_live(speaker_id, &gate).await {
            // Lost the race against another delete; if the speaker was
            // re-created in the meantime, this delete ordered before it.
            return Ok(());
        }

        self.generation.delete_speaker(speaker_id).await?;
        self.synthesis.delete_voice(speaker_id).await?;
        self.engine.delete_speaker(speaker_id).await;
        self.speakers.write().await.remove(speaker_id);
        info!(speaker = speaker_id, "speaker deleted");
        Ok(())
    }

    /// Ends the current conversation: clears the generation history and
    /// rewinds the script session. The speaker and its forest survive.
    pub async fn reset(&self, speaker_id: &str) -> Result<()> {
        let _profile = self.guard(speaker_id).await?;
        self.generation.empty_history(speaker_id).await?;
        self.engine.reset_state(speaker_id).await?;
        info!(speaker = speaker_id, "dialogue ended, session rewound");
        Ok(())
    }

    /// Inserts or replaces a script node for an existing speaker, under its
    /// write gate.
    pub async fn script_line(&self, speaker_id: &str, node: ScriptNode) -> Result<()> {
        let _profile = self.guard(speaker_id).await?;
        self.engine.script_line(speaker_id, node).await
    }

    pub async fn contains(&self, speaker_id: &str) -> bool {
        self.speakers.read().await.contains_key(speaker_id)
    }

    /// Snapshot of a speaker's profile, if it exists. Waits for the write
    /// gate, so it observes settled state.
    pub async fn profile(&self, speaker_id: &str) -> Option<SpeakerProfile> {
        let gate = self.lookup_gate(speaker_id).await?;
        let profile = gate.lock().await;
        Some(profile.clone())
    }

    /// Acquires the speaker's write gate, failing if the speaker does not
    /// exist. Callers hold the returned guard for the duration of their
    /// operation.
    pub(crate) async fn guard(&self, speaker_id: &str) -> Result<OwnedMutexGuard<SpeakerProfile>> {
        let gate = self
            .lookup_gate(speaker_id)
            .await
            .ok_or_else(|| DialogueError::UnknownSpeaker(speaker_id.to_string()))?;
        let profile = Arc::clone(&gate).lock_owned().await;
        // The speaker may have been deleted (or deleted and re-created under
        // a new gate) while we waited.
        if !self.gate_is_live(speaker_id, &gate).await {
            return Err(DialogueError::UnknownSpeaker(speaker_id.to_string()));
        }
        Ok(profile)
    }

    async fn lookup_gate(&self, speaker_id: &str) -> Option<Arc<Mutex<SpeakerProfile>>> {
        let speakers = self.speakers.read().await;
        speakers.get(speaker_id).cloned()
    }

    /// True while `gate` is still the live map entry for the speaker. False
    /// means the entry was deleted (and possibly re-created with a new gate)
    /// while the caller waited on the lock.
    async fn gate_is_live(&self, speaker_id: &str, gate: &Arc<Mutex<SpeakerProfile>>) -> bool {
        self.speakers
            .read()
            .await
            .get(speaker_id)
            .is_some_and(|live| Arc::ptr_eq(live, gate))
    }
}

fn derive_voice_id(speaker_id: &str, traits: &[String]) -> i64 {
    match traits.first().map(|t| t.trim().parse::<i64>()) {
        Some(Ok(voice_id)) => voice_id,
        _ => {
            warn!(
                speaker = speaker_id,
                ?traits,
                "voice id unrecognized in traits, defaulting to 0"
            );
            0
        }
    }
}
