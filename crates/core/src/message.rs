//! Defines the JSON request/response protocol between embedding applications
//! and the dialogue core.
//!
//! Parsing happens in two phases so that an unrecognized command and a
//! malformed payload are reported as distinct failures: first the `cmd` field
//! is probed and checked against the command table, then the full payload is
//! deserialized into its typed form. Nothing is mutated until both phases
//! pass.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{DialogueError, Result};

/// Wire status codes carried in every response.
pub mod status {
    pub const OK: u8 = 0;
    pub const INVALID_MESSAGE: u8 = 1;
    pub const UNSUPPORTED_COMMAND: u8 = 2;
    pub const UNKNOWN_SPEAKER: u8 = 3;
    pub const INVALID_SCRIPT_NODE: u8 = 4;
    pub const INTERNAL_ERROR: u8 = 5;
}

/// Requests accepted by the dispatcher.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Registers a speaker with all collaborator backends.
    CreateSpeaker {
        speaker_id: String,
        persona: String,
        temperature: f32,
        /// Free-form speaker traits; the first entry, when it parses as an
        /// integer, selects the synthesis voice.
        traits: Vec<String>,
    },
    /// Advances one dialogue turn for a speaker.
    StepDialog { speaker_id: String, line: String },
    /// Inserts or replaces one scripted dialogue rule.
    ScriptLine {
        speaker_id: String,
        /// Parent node id, or `null` to attach the rule at the root.
        parent: Option<String>,
        node_id: String,
        cue_lines: Vec<String>,
        script_lines: Vec<String>,
        expires_after: i64,
        threshold: f32,
    },
    /// Removes a speaker everywhere. Unknown speakers are ignored.
    DeleteSpeaker { speaker_id: String },
    /// Ends the current conversation, keeping the speaker and its scripts.
    EndDialog { speaker_id: String },
}

/// Responses produced by the dispatcher. Serialized untagged so each kind
/// carries exactly its own fields plus `status`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Response {
    /// Bare acknowledgement for lifecycle and script commands.
    Ack { status: u8 },
    /// Full dialogue turn result.
    Step {
        status: u8,
        /// Flattened synthesized audio samples.
        reply: Vec<f32>,
        reply_text: String,
        /// Id of the script node that fired, or `null` for generated-only turns.
        script_triggered: Option<String>,
    },
    /// Any rejected or failed request.
    Failure { status: u8, error: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ack { status: status::OK }
    }

    pub fn step(reply: Vec<f32>, reply_text: String, script_triggered: Option<String>) -> Self {
        Response::Step {
            status: status::OK,
            reply,
            reply_text,
            script_triggered,
        }
    }

    pub fn failure(err: &DialogueError) -> Self {
        Response::Failure {
            status: err.status_code(),
            error: err.to_string(),
        }
    }

    /// The status code carried by this response.
    pub fn status(&self) -> u8 {
        match self {
            Response::Ack { status }
            | Response::Step { status, .. }
            | Response::Failure { status, .. } => *status,
        }
    }
}

/// One row of the command table: the `cmd` value and the fields a request
/// must carry.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

/// Every command the dispatcher understands.
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "create_speaker",
        required: &["speaker_id", "persona", "temperature", "traits"],
    },
    CommandSpec {
        name: "step_dialog",
        required: &["speaker_id", "line"],
    },
    CommandSpec {
        name: "script_line",
        required: &[
            "speaker_id",
            "parent",
            "node_id",
            "cue_lines",
            "script_lines",
            "expires_after",
            "threshold",
        ],
    },
    CommandSpec {
        name: "delete_speaker",
        required: &["speaker_id"],
    },
    CommandSpec {
        name: "end_dialog",
        required: &["speaker_id"],
    },
];

/// Parses a raw JSON request into its typed form.
///
/// Phase one rejects non-objects, a missing or non-string `cmd`, and unknown
/// commands. Phase two checks that every required field is present (a `null`
/// value satisfies presence, so `script_line` can attach at the root), then
/// deserializes the typed payload, which catches wrongly typed fields.
pub fn parse_request(value: &Value) -> Result<Request> {
    let obj = value
        .as_object()
        .ok_or_else(|| DialogueError::InvalidMessage("request must be a JSON object".into()))?;

    let cmd = match obj.get("cmd") {
        None => {
            return Err(DialogueError::InvalidMessage(
                "missing required field `cmd`".into(),
            ));
        }
        Some(Value::String(cmd)) => cmd.as_str(),
        Some(_) => {
            return Err(DialogueError::InvalidMessage(
                "field `cmd` must be a string".into(),
            ));
        }
    };

    let spec = COMMANDS
        .iter()
        .find(|spec| spec.name == cmd)
        .ok_or_else(|| DialogueError::UnsupportedCommand(cmd.to_string()))?;

    for field in spec.required {
        if !obj.contains_key(*field) {
            return Err(DialogueError::InvalidMessage(format!(
                "command `{cmd}` missing required field `{field}`"
            )));
        }
    }

    serde_json::from_value(value.clone())
        .map_err(|err| DialogueError::InvalidMessage(format!("malformed `{cmd}` payload: {err}")))
}

/// One JSON template per command, every required field filled with a
/// zero value of the expected type. Intended for clients and test harnesses
/// discovering the protocol.
pub fn request_templates() -> Vec<Value> {
    vec![
        json!({
            "cmd": "create_speaker",
            "speaker_id": "",
            "persona": "",
            "temperature": 0.0,
            "traits": [""],
        }),
        json!({
            "cmd": "step_dialog",
            "speaker_id": "",
            "line": "",
        }),
        json!({
            "cmd": "script_line",
            "speaker_id": "",
            "parent": null,
            "node_id": "",
            "cue_lines": [""],
            "script_lines": [""],
            "expires_after": 0,
            "threshold": 0.0,
        }),
        json!({
            "cmd": "delete_speaker",
            "speaker_id": "",
        }),
        json!({
            "cmd": "end_dialog",
            "speaker_id": "",
        }),
    ]
}
