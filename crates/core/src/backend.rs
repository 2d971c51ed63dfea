//! Contracts for the three collaborator backends the dialogue core consumes,
//! plus deterministic in-process implementations for development and
//! integration testing.
//!
//! The core never loads or configures a model itself. Real deployments
//! implement these traits over whatever inference stack they run; everything
//! in this crate is written against the traits alone.

use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;

/// Scores how well a user utterance matches a scripted exemplar cue.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SimilarityBackend: Send + Sync {
    /// Similarity of `utterance` to `exemplar`, in `[0, 1]`.
    async fn score(&self, utterance: &str, exemplar: &str) -> Result<f32>;
}

/// Produces reply text for a speaker, keeping per-speaker conversation state.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait TextGenerationBackend: Send + Sync {
    /// Registers a speaker with its persona and sampling temperature.
    async fn add_speaker(&self, speaker_id: &str, persona: &str, temperature: f32) -> Result<()>;

    /// Produces the reply for one dialogue turn. When `hint` is present it is
    /// a scripted line the backend may return verbatim or continue from.
    async fn step_dialog(&self, speaker_id: &str, line: &str, hint: Option<&str>)
    -> Result<String>;

    /// Removes the speaker and all its conversation state.
    async fn delete_speaker(&self, speaker_id: &str) -> Result<()>;

    /// Clears the speaker's conversation history, keeping the speaker.
    async fn empty_history(&self, speaker_id: &str) -> Result<()>;
}

/// Turns reply text into audio for a speaker's voice.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SpeechSynthesisBackend: Send + Sync {
    /// Registers a voice for the speaker.
    async fn create_voice(&self, speaker_id: &str, voice_id: i64) -> Result<()>;

    /// Synthesizes `text` in the speaker's voice, returning flat samples.
    async fn tts(&self, speaker_id: &str, text: &str) -> Result<Vec<f32>>;

    /// Removes the speaker's voice.
    async fn delete_voice(&self, speaker_id: &str) -> Result<()>;
}

/// A lexical [`SimilarityBackend`] for development and integration testing.
///
/// Treats the exemplar as a fuzzy pattern searched within the utterance and
/// normalizes the raw match score by the exemplar's self-match score, so an
/// utterance containing the exemplar verbatim scores at or near `1.0` and an
/// unrelated utterance scores `0.0`. Deterministic and entirely in-process.
pub struct LexicalSimilarity {
    matcher: SkimMatcherV2,
}

impl LexicalSimilarity {
    pub fn new() -> Self {
        Self {
            matcher: SkimMatcherV2::default(),
        }
    }
}

impl Default for LexicalSimilarity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimilarityBackend for LexicalSimilarity {
    async fn score(&self, utterance: &str, exemplar: &str) -> Result<f32> {
        let exemplar = exemplar.to_lowercase();
        let ceiling = self.matcher.fuzzy_match(&exemplar, &exemplar).unwrap_or(0);
        if ceiling == 0 {
            return Ok(0.0);
        }
        let raw = self
            .matcher
            .fuzzy_match(&utterance.to_lowercase(), &exemplar)
            .unwrap_or(0);
        Ok((raw as f32 / ceiling as f32).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Default)]
struct SpeakerLog {
    persona: String,
    temperature: f32,
    turns: Vec<String>,
}

/// A [`TextGenerationBackend`] for development and integration testing.
///
/// Returns the scripted hint verbatim when one is supplied and a deterministic
/// echo of the user line otherwise, while keeping the same per-speaker
/// registration and history bookkeeping a real model server would.
#[derive(Default)]
pub struct EchoGeneration {
    speakers: Mutex<HashMap<String, SpeakerLog>>,
}

impl EchoGeneration {
    /// The recorded turns (user lines and replies, interleaved) for a speaker.
    pub async fn history(&self, speaker_id: &str) -> Option<Vec<String>> {
        self.speakers
            .lock()
            .await
            .get(speaker_id)
            .map(|log| log.turns.clone())
    }

    /// The registered persona and temperature for a speaker.
    pub async fn profile(&self, speaker_id: &str) -> Option<(String, f32)> {
        self.speakers
            .lock()
            .await
            .get(speaker_id)
            .map(|log| (log.persona.clone(), log.temperature))
    }
}

#[async_trait]
impl TextGenerationBackend for EchoGeneration {
    async fn add_speaker(&self, speaker_id: &str, persona: &str, temperature: f32) -> Result<()> {
        self.speakers.lock().await.insert(
            speaker_id.to_string(),
            SpeakerLog {
                persona: persona.to_string(),
                temperature,
                turns: Vec::new(),
            },
        );
        Ok(())
    }

    async fn step_dialog(
        &self,
        speaker_id: &str,
        line: &str,
        hint: Option<&str>,
    ) -> Result<String> {
        let mut speakers = self.speakers.lock().await;
        let Some(log) = speakers.get_mut(speaker_id) else {
            bail!("no generation entry for speaker {speaker_id}");
        };
        log.turns.push(line.to_string());
        let reply = match hint {
            Some(hint) => hint.to_string(),
            None => format!("{} says: {line}", log.persona),
        };
        log.turns.push(reply.clone());
        Ok(reply)
    }

    async fn delete_speaker(&self, speaker_id: &str) -> Result<()> {
        // Removal is idempotent; a missing entry is not an error.
        self.speakers.lock().await.remove(speaker_id);
        Ok(())
    }

    async fn empty_history(&self, speaker_id: &str) -> Result<()> {
        let mut speakers = self.speakers.lock().await;
        let Some(log) = speakers.get_mut(speaker_id) else {
            bail!("no generation entry for speaker {speaker_id}");
        };
        log.turns.clear();
        Ok(())
    }
}

const SAMPLE_RATE: f32 = 22_050.0;
const SAMPLES_PER_CHAR: usize = 4;

/// A [`SpeechSynthesisBackend`] for development and integration testing.
///
/// Emits a short sine burst whose frequency is derived from the registered
/// voice id and whose length tracks the text length. Deterministic, so tests
/// can compare outputs across calls.
#[derive(Default)]
pub struct ToneSynthesis {
    voices: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl SpeechSynthesisBackend for ToneSynthesis {
    async fn create_voice(&self, speaker_id: &str, voice_id: i64) -> Result<()> {
        self.voices
            .lock()
            .await
            .insert(speaker_id.to_string(), voice_id);
        Ok(())
    }

    async fn tts(&self, speaker_id: &str, text: &str) -> Result<Vec<f32>> {
        let voice_id = {
            let voices = self.voices.lock().await;
            match voices.get(speaker_id) {
                Some(voice_id) => *voice_id,
                None => bail!("no voice registered for speaker {speaker_id}"),
            }
        };
        let freq = 220.0 * (voice_id.rem_euclid(12) + 1) as f32;
        let len = text.chars().count() * SAMPLES_PER_CHAR;
        let samples = (0..len)
            .map(|i| (i as f32 * freq * std::f32::consts::TAU / SAMPLE_RATE).sin() * 0.1)
            .collect();
        Ok(samples)
    }

    async fn delete_voice(&self, speaker_id: &str) -> Result<()> {
        // Removal is idempotent; a missing entry is not an error.
        self.voices.lock().await.remove(speaker_id);
        Ok(())
    }
}
