//! Conversational orchestration core for an NPC dialogue service.
//!
//! Manages per-speaker sessions, decides between scripted and generated
//! dialogue, and assembles multimodal replies from three collaborator
//! backends (similarity scoring, text generation, speech synthesis). The
//! backends are consumed through the traits in [`backend`]; everything with
//! real state lives here: the command dispatcher, the speaker registry, and
//! the scripted-dialogue state machine.

pub mod backend;
pub mod composer;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod registry;
pub mod script;
