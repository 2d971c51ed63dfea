//! The scripted-dialogue state machine.
//!
//! Each speaker owns a forest of script nodes. A node binds exemplar cue
//! utterances to canned reply lines and may nest under a parent node, so a
//! rule only becomes eligible once its parent's context is active. The engine
//! tracks, per speaker, which node currently holds the context and how many
//! turns have passed since it last changed, reverting expired contexts to
//! their parent.
//!
//! Scoring is delegated to a [`SimilarityBackend`]; the engine only
//! aggregates scores, compares them against per-node thresholds, and commits
//! transitions.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::backend::SimilarityBackend;
use crate::error::{DialogueError, Result};

/// One scripted dialogue rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptNode {
    pub node_id: String,
    /// Parent node id; `None` attaches the rule at the root of the forest.
    pub parent_id: Option<String>,
    /// Exemplar utterances this rule should respond to. Never empty.
    pub cue_lines: Vec<String>,
    /// Candidate replies, cycled round-robin across triggers. Never empty.
    pub script_lines: Vec<String>,
    /// Consecutive unmatched turns before the context reverts to the parent;
    /// `0` disables expiry.
    pub expires_after: i64,
    /// Minimum similarity score required to trigger, in `[0, 1]`.
    pub threshold: f32,
}

/// A speaker's position in its script forest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub active_node_id: Option<String>,
    pub turns_since_transition: u32,
}

/// A script rule fired: the reply line chosen for this turn and the node
/// that now holds the context.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMatch {
    pub line: String,
    pub node_id: String,
}

#[derive(Debug)]
struct StoredNode {
    node: ScriptNode,
    /// Insertion order, stable across upserts; breaks score ties.
    seq: u64,
    reply_cursor: usize,
}

#[derive(Debug, Default)]
struct SpeakerScript {
    nodes: HashMap<String, StoredNode>,
    next_seq: u64,
    active_node_id: Option<String>,
    turns_since_transition: u32,
}

impl SpeakerScript {
    /// Walks up from `new_parent`; reaching `node_id` means the reparent
    /// would close a cycle.
    fn would_cycle(&self, node_id: &str, new_parent: &str) -> bool {
        let mut current = Some(new_parent);
        while let Some(id) = current {
            if id == node_id {
                return true;
            }
            current = self.nodes.get(id).and_then(|n| n.node.parent_id.as_deref());
        }
        false
    }
}

struct CandidateSnapshot {
    node_id: String,
    cue_lines: Vec<String>,
    threshold: f32,
    seq: u64,
}

/// Per-speaker script forests plus the matching logic that advances them.
pub struct DialogScriptEngine {
    similarity: Arc<dyn SimilarityBackend>,
    speakers: RwLock<HashMap<String, Arc<Mutex<SpeakerScript>>>>,
}

impl DialogScriptEngine {
    pub fn new(similarity: Arc<dyn SimilarityBackend>) -> Self {
        Self {
            similarity,
            speakers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a speaker with an empty session and an empty forest,
    /// replacing any existing forest for the same id.
    pub async fn add_speaker(&self, speaker_id: &str) {
        self.speakers.write().await.insert(
            speaker_id.to_string(),
            Arc::new(Mutex::new(SpeakerScript::default())),
        );
    }

    pub async fn delete_speaker(&self, speaker_id: &str) {
        self.speakers.write().await.remove(speaker_id);
    }

    /// Rewinds the speaker's session to the root context. The script forest
    /// is untouched.
    pub async fn reset_state(&self, speaker_id: &str) -> Result<()> {
        let entry = self.lookup(speaker_id).await?;
        let mut script = entry.lock().await;
        script.active_node_id = None;
        script.turns_since_transition = 0;
        Ok(())
    }

    /// Current session snapshot for a speaker, if it exists.
    pub async fn session_state(&self, speaker_id: &str) -> Option<SessionState> {
        let entry = self.speakers.read().await.get(speaker_id).cloned()?;
        let script = entry.lock().await;
        Some(SessionState {
            active_node_id: script.active_node_id.clone(),
            turns_since_transition: script.turns_since_transition,
        })
    }

    /// Inserts or replaces one script node.
    ///
    /// A replaced node keeps its insertion position (so score tie-breaking is
    /// stable) and restarts its reply rotation. The parent must already exist
    /// and may not be the node itself or one of its descendants.
    pub async fn script_line(&self, speaker_id: &str, node: ScriptNode) -> Result<()> {
        validate_node(&node)?;
        let entry = self.lookup(speaker_id).await?;
        let mut script = entry.lock().await;

        if let Some(parent_id) = &node.parent_id {
            if !script.nodes.contains_key(parent_id) {
                return Err(invalid_node(
                    &node.node_id,
                    format!("parent `{parent_id}` does not exist"),
                ));
            }
            if script.would_cycle(&node.node_id, parent_id) {
                return Err(invalid_node(
                    &node.node_id,
                    format!("parent `{parent_id}` is the node itself or one of its descendants"),
                ));
            }
        }

        match script.nodes.get_mut(&node.node_id) {
            Some(stored) => {
                stored.node = node;
                stored.reply_cursor = 0;
            }
            None => {
                let seq = script.next_seq;
                script.next_seq += 1;
                debug!(speaker = speaker_id, node = %node.node_id, "script node added");
                script.nodes.insert(
                    node.node_id.clone(),
                    StoredNode {
                        node,
                        seq,
                        reply_cursor: 0,
                    },
                );
            }
        }
        Ok(())
    }

    /// Advances one scripted turn for a speaker.
    ///
    /// Candidates are the children of the active node (or the root nodes when
    /// no context is active). The best-scoring candidate triggers when it
    /// clears its own threshold; otherwise the turn counts against the active
    /// context's expiry. A similarity backend failure is logged and treated
    /// as "nothing matched" so the turn still completes.
    pub async fn step(&self, speaker_id: &str, line: &str) -> Result<Option<ScriptMatch>> {
        let entry = self.lookup(speaker_id).await?;

        // Snapshot the candidate set, then score with the state lock
        // released; scoring can take model-inference time.
        let candidates = {
            let script = entry.lock().await;
            let context = script.active_node_id.clone();
            let mut candidates: Vec<CandidateSnapshot> = script
                .nodes
                .values()
                .filter(|stored| stored.node.parent_id == context)
                .map(|stored| CandidateSnapshot {
                    node_id: stored.node.node_id.clone(),
                    cue_lines: stored.node.cue_lines.clone(),
                    threshold: stored.node.threshold,
                    seq: stored.seq,
                })
                .collect();
            candidates.sort_by_key(|candidate| candidate.seq);
            candidates
        };

        let matched = match self.best_match(line, &candidates).await {
            Ok(matched) => matched,
            Err(err) => {
                error!(
                    speaker = speaker_id,
                    error = %err,
                    "similarity scoring failed, falling back to generated dialogue"
                );
                None
            }
        };

        let mut script = entry.lock().await;
        if let Some((node_id, score)) = matched {
            let reply = match script.nodes.get_mut(&node_id) {
                Some(stored) => {
                    let len = stored.node.script_lines.len();
                    let reply = stored.node.script_lines[stored.reply_cursor % len].clone();
                    stored.reply_cursor += 1;
                    Some(reply)
                }
                // The node was replaced out from under us; treat the turn as
                // unmatched.
                None => None,
            };
            if let Some(line) = reply {
                script.active_node_id = Some(node_id.clone());
                script.turns_since_transition = 0;
                info!(speaker = speaker_id, node = %node_id, score, "script node triggered");
                return Ok(Some(ScriptMatch { line, node_id }));
            }
        }

        script.turns_since_transition += 1;
        let revert_to = script.active_node_id.as_ref().and_then(|active_id| {
            script.nodes.get(active_id).and_then(|active| {
                let expired = active.node.expires_after > 0
                    && i64::from(script.turns_since_transition) > active.node.expires_after;
                expired.then(|| active.node.parent_id.clone())
            })
        });
        if let Some(parent) = revert_to {
            debug!(
                speaker = speaker_id,
                from = script.active_node_id.as_deref(),
                to = parent.as_deref(),
                "script context expired, reverting to parent"
            );
            script.active_node_id = parent;
            script.turns_since_transition = 0;
        }
        Ok(None)
    }

    async fn best_match(
        &self,
        line: &str,
        candidates: &[CandidateSnapshot],
    ) -> anyhow::Result<Option<(String, f32)>> {
        let mut best: Option<(&CandidateSnapshot, f32)> = None;
        for candidate in candidates {
            let mut similarity = 0.0f32;
            for cue in &candidate.cue_lines {
                let score = self.similarity.score(line, cue).await?;
                similarity = similarity.max(score);
            }
            // Strictly greater keeps the earliest-inserted candidate on ties.
            let improves = match &best {
                Some((_, best_score)) => similarity > *best_score,
                None => true,
            };
            if improves {
                best = Some((candidate, similarity));
            }
        }
        Ok(best
            .filter(|(candidate, score)| *score >= candidate.threshold)
            .map(|(candidate, score)| (candidate.node_id.clone(), score)))
    }

    async fn lookup(&self, speaker_id: &str) -> Result<Arc<Mutex<SpeakerScript>>> {
        self.speakers
            .read()
            .await
            .get(speaker_id)
            .cloned()
            .ok_or_else(|| DialogueError::UnknownSpeaker(speaker_id.to_string()))
    }
}

fn validate_node(node: &ScriptNode) -> Result<()> {
    if node.cue_lines.is_empty() {
        return Err(invalid_node(&node.node_id, "cue_lines must not be empty"));
    }
    if node.script_lines.is_empty() {
        return Err(invalid_node(&node.node_id, "script_lines must not be empty"));
    }
    if !(0.0..=1.0).contains(&node.threshold) {
        return Err(invalid_node(
            &node.node_id,
            format!("threshold {} outside [0, 1]", node.threshold),
        ));
    }
    if node.expires_after < 0 {
        return Err(invalid_node(
            &node.node_id,
            format!("expires_after {} is negative", node.expires_after),
        ));
    }
    Ok(())
}

fn invalid_node(node_id: &str, reason: impl Into<String>) -> DialogueError {
    DialogueError::InvalidScriptNode(node_id.to_string(), reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockSimilarityBackend;

    fn node(
        node_id: &str,
        parent: Option<&str>,
        cues: &[&str],
        lines: &[&str],
        expires_after: i64,
        threshold: f32,
    ) -> ScriptNode {
        ScriptNode {
            node_id: node_id.to_string(),
            parent_id: parent.map(str::to_string),
            cue_lines: cues.iter().map(|s| s.to_string()).collect(),
            script_lines: lines.iter().map(|s| s.to_string()).collect(),
            expires_after,
            threshold,
        }
    }

    /// Scores 1.0 when the utterance equals the cue, 0.0 otherwise.
    fn exact_match_scorer() -> MockSimilarityBackend {
        let mut similarity = MockSimilarityBackend::new();
        similarity.expect_score().returning(|utterance, exemplar| {
            let score = if utterance == exemplar { 1.0 } else { 0.0 };
            Box::pin(async move { Ok(score) })
        });
        similarity
    }

    async fn engine_for(speaker: &str, similarity: MockSimilarityBackend) -> DialogScriptEngine {
        let engine = DialogScriptEngine::new(Arc::new(similarity));
        engine.add_speaker(speaker).await;
        engine
    }

    async fn state(engine: &DialogScriptEngine, speaker: &str) -> SessionState {
        engine.session_state(speaker).await.unwrap()
    }

    #[tokio::test]
    async fn trigger_transitions_and_round_robins_replies() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line(
                "guard",
                node("greet", None, &["hello"], &["well met", "you again"], 0, 0.8),
            )
            .await
            .unwrap();

        let first = engine.step("guard", "hello").await.unwrap().unwrap();
        assert_eq!(first.node_id, "greet");
        assert_eq!(first.line, "well met");
        assert_eq!(
            state(&engine, "guard").await,
            SessionState {
                active_node_id: Some("greet".into()),
                turns_since_transition: 0
            }
        );

        // The node has no children, so its own cue no longer matches; rewind
        // and trigger again to see the rotation advance.
        engine.reset_state("guard").await.unwrap();
        let second = engine.step("guard", "hello").await.unwrap().unwrap();
        assert_eq!(second.line, "you again");

        engine.reset_state("guard").await.unwrap();
        let third = engine.step("guard", "hello").await.unwrap().unwrap();
        assert_eq!(third.line, "well met");
    }

    #[tokio::test]
    async fn ties_go_to_the_earliest_inserted_node() {
        let mut similarity = MockSimilarityBackend::new();
        similarity
            .expect_score()
            .returning(|_, _| Box::pin(async move { Ok(0.7) }));
        let engine = engine_for("guard", similarity).await;

        engine
            .script_line("guard", node("alpha", None, &["hi"], &["from alpha"], 0, 0.5))
            .await
            .unwrap();
        engine
            .script_line("guard", node("beta", None, &["hi"], &["from beta"], 0, 0.5))
            .await
            .unwrap();

        let hit = engine.step("guard", "hi").await.unwrap().unwrap();
        assert_eq!(hit.node_id, "alpha");

        // Replacing alpha keeps its insertion position, so it still wins.
        engine.reset_state("guard").await.unwrap();
        engine
            .script_line("guard", node("alpha", None, &["hi"], &["replaced"], 0, 0.5))
            .await
            .unwrap();
        let hit = engine.step("guard", "hi").await.unwrap().unwrap();
        assert_eq!(hit.node_id, "alpha");
        assert_eq!(hit.line, "replaced");
    }

    #[tokio::test]
    async fn a_low_threshold_candidate_cannot_outrank_the_best() {
        // strict scores 0.9 but demands 0.95; loose scores 0.4 and demands
        // 0.1. The best candidate is strict, and it misses its threshold, so
        // nothing fires.
        let mut similarity = MockSimilarityBackend::new();
        similarity.expect_score().returning(|_, exemplar| {
            let score = if exemplar == "strict cue" { 0.9 } else { 0.4 };
            Box::pin(async move { Ok(score) })
        });
        let engine = engine_for("guard", similarity).await;

        engine
            .script_line("guard", node("strict", None, &["strict cue"], &["s"], 0, 0.95))
            .await
            .unwrap();
        engine
            .script_line("guard", node("loose", None, &["loose cue"], &["l"], 0, 0.1))
            .await
            .unwrap();

        assert!(engine.step("guard", "anything").await.unwrap().is_none());
        assert_eq!(state(&engine, "guard").await.turns_since_transition, 1);
    }

    #[tokio::test]
    async fn similarity_is_the_max_over_cue_lines() {
        let mut similarity = MockSimilarityBackend::new();
        similarity.expect_score().returning(|_, exemplar| {
            let score = if exemplar == "good cue" { 0.9 } else { 0.1 };
            Box::pin(async move { Ok(score) })
        });
        let engine = engine_for("guard", similarity).await;

        engine
            .script_line(
                "guard",
                node("greet", None, &["bad cue", "good cue"], &["hi"], 0, 0.8),
            )
            .await
            .unwrap();

        assert!(engine.step("guard", "x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn context_expires_only_after_the_counter_exceeds_the_limit() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 2, 0.8))
            .await
            .unwrap();

        engine.step("guard", "hello").await.unwrap().unwrap();

        // Two unmatched turns stay inside the expiry window.
        assert!(engine.step("guard", "zzz").await.unwrap().is_none());
        assert_eq!(
            state(&engine, "guard").await,
            SessionState {
                active_node_id: Some("greet".into()),
                turns_since_transition: 1
            }
        );
        assert!(engine.step("guard", "zzz").await.unwrap().is_none());
        assert_eq!(
            state(&engine, "guard").await,
            SessionState {
                active_node_id: Some("greet".into()),
                turns_since_transition: 2
            }
        );

        // The third pushes the counter past the limit: revert, same turn
        // still reports no match.
        assert!(engine.step("guard", "zzz").await.unwrap().is_none());
        assert_eq!(
            state(&engine, "guard").await,
            SessionState {
                active_node_id: None,
                turns_since_transition: 0
            }
        );

        // Back at the root the node is a candidate again.
        assert!(engine.step("guard", "hello").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_expiry_holds_the_context_forever() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 0, 0.8))
            .await
            .unwrap();

        engine.step("guard", "hello").await.unwrap().unwrap();
        for _ in 0..5 {
            assert!(engine.step("guard", "zzz").await.unwrap().is_none());
        }
        assert_eq!(
            state(&engine, "guard").await,
            SessionState {
                active_node_id: Some("greet".into()),
                turns_since_transition: 5
            }
        );
    }

    #[tokio::test]
    async fn only_children_of_the_active_node_are_candidates() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 0, 0.8))
            .await
            .unwrap();
        engine
            .script_line(
                "guard",
                node("rumors", Some("greet"), &["any news"], &["the mine closed"], 0, 0.8),
            )
            .await
            .unwrap();

        // The nested rule is not reachable from the root.
        assert!(engine.step("guard", "any news").await.unwrap().is_none());

        engine.step("guard", "hello").await.unwrap().unwrap();
        let hit = engine.step("guard", "any news").await.unwrap().unwrap();
        assert_eq!(hit.node_id, "rumors");

        // With `rumors` active and childless, nothing matches any more.
        assert!(engine.step("guard", "hello").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn an_expired_child_reverts_to_its_parent_not_the_root() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 0, 0.8))
            .await
            .unwrap();
        engine
            .script_line(
                "guard",
                node("rumors", Some("greet"), &["any news"], &["the mine closed"], 1, 0.8),
            )
            .await
            .unwrap();

        engine.step("guard", "hello").await.unwrap().unwrap();
        engine.step("guard", "any news").await.unwrap().unwrap();

        assert!(engine.step("guard", "zzz").await.unwrap().is_none());
        assert!(engine.step("guard", "zzz").await.unwrap().is_none());
        assert_eq!(
            state(&engine, "guard").await,
            SessionState {
                active_node_id: Some("greet".into()),
                turns_since_transition: 0
            }
        );
    }

    #[tokio::test]
    async fn a_scoring_failure_degrades_to_an_unmatched_turn() {
        let mut similarity = MockSimilarityBackend::new();
        similarity
            .expect_score()
            .returning(|_, _| Box::pin(async move { Err(anyhow::anyhow!("scorer offline")) }));
        let engine = engine_for("guard", similarity).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 0, 0.0))
            .await
            .unwrap();

        let outcome = engine.step("guard", "hello").await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(state(&engine, "guard").await.turns_since_transition, 1);
    }

    #[tokio::test]
    async fn reset_rewinds_the_session_but_keeps_the_forest() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 0, 0.8))
            .await
            .unwrap();
        engine.step("guard", "hello").await.unwrap().unwrap();

        engine.reset_state("guard").await.unwrap();
        assert_eq!(
            state(&engine, "guard").await,
            SessionState {
                active_node_id: None,
                turns_since_transition: 0
            }
        );
        assert!(engine.step("guard", "hello").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn re_adding_a_speaker_clears_its_forest() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 0, 0.8))
            .await
            .unwrap();

        engine.add_speaker("guard").await;
        assert!(engine.step("guard", "hello").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn node_validation_rejects_bad_fields() {
        let engine = engine_for("guard", exact_match_scorer()).await;

        let cases = [
            node("n", None, &[], &["x"], 0, 0.5),
            node("n", None, &["c"], &[], 0, 0.5),
            node("n", None, &["c"], &["x"], 0, 1.5),
            node("n", None, &["c"], &["x"], 0, -0.1),
            node("n", None, &["c"], &["x"], 0, f32::NAN),
            node("n", None, &["c"], &["x"], -1, 0.5),
        ];
        for bad in cases {
            let err = engine.script_line("guard", bad).await.unwrap_err();
            assert!(matches!(err, DialogueError::InvalidScriptNode(_, _)), "{err}");
        }
    }

    #[tokio::test]
    async fn a_missing_parent_is_rejected() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        let err = engine
            .script_line("guard", node("orphan", Some("ghost"), &["c"], &["x"], 0, 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::InvalidScriptNode(_, _)));
    }

    #[tokio::test]
    async fn reparenting_into_a_cycle_is_rejected_and_changes_nothing() {
        let engine = engine_for("guard", exact_match_scorer()).await;
        engine
            .script_line("guard", node("greet", None, &["hello"], &["well met"], 0, 0.8))
            .await
            .unwrap();
        engine
            .script_line("guard", node("rumors", Some("greet"), &["any news"], &["x"], 0, 0.8))
            .await
            .unwrap();

        // Self-parent and descendant-parent are both cycles.
        let err = engine
            .script_line("guard", node("greet", Some("greet"), &["hello"], &["y"], 0, 0.8))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::InvalidScriptNode(_, _)));
        let err = engine
            .script_line("guard", node("greet", Some("rumors"), &["hello"], &["y"], 0, 0.8))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::InvalidScriptNode(_, _)));

        // The rejected upsert left the original rule in place.
        let hit = engine.step("guard", "hello").await.unwrap().unwrap();
        assert_eq!(hit.line, "well met");
    }

    #[tokio::test]
    async fn unknown_speakers_are_rejected() {
        let engine = engine_for("guard", exact_match_scorer()).await;

        let err = engine.step("stranger", "hello").await.unwrap_err();
        assert!(matches!(err, DialogueError::UnknownSpeaker(_)));

        let err = engine.reset_state("stranger").await.unwrap_err();
        assert!(matches!(err, DialogueError::UnknownSpeaker(_)));

        let err = engine
            .script_line("stranger", node("n", None, &["c"], &["x"], 0, 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::UnknownSpeaker(_)));

        assert!(engine.session_state("stranger").await.is_none());
    }
}
