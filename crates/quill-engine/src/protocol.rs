//! Text protocol between the engine and the model.
//!
//! The model writes ReAct-style turns:
//!
//! ```text
//! Thought: I need to compute this.
//! Action: calculator
//! Action Input: 2^8
//! ```
//!
//! or, once it is done,
//!
//! ```text
//! Thought: I know the answer.
//! Final Answer: The answer is 256.
//! ```
//!
//! Generation stops at [`OBSERVATION_STOP`]; the engine appends the
//! observation itself.

use quill_core::turns::ToolInvocation;

pub const THOUGHT: &str = "Thought:";
pub const ACTION: &str = "Action:";
pub const ACTION_INPUT: &str = "Action Input:";
pub const OBSERVATION: &str = "Observation:";
pub const FINAL_ANSWER: &str = "Final Answer:";

/// Stop sequence sent with every generation request.
pub const OBSERVATION_STOP: &str = "\nObservation:";

/// A fully generated model turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedTurn {
    /// `answer` is the text after `Final Answer:`, or the whole output when
    /// the model used no marker at all (`marked == false`).
    FinalAnswer {
        thought: Option<String>,
        answer: String,
        marked: bool,
    },
    ToolCall {
        thought: Option<String>,
        invocation: ToolInvocation,
    },
}

impl ParsedTurn {
    pub fn thought(&self) -> Option<&str> {
        match self {
            Self::FinalAnswer { thought, .. } | Self::ToolCall { thought, .. } => thought.as_deref(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Marker {
    FinalAnswer(usize),
    Action(usize),
}

/// First decisive marker in `text`, with its byte offset.
fn first_marker(text: &str) -> Option<Marker> {
    match (text.find(FINAL_ANSWER), text.find(ACTION)) {
        (Some(f), Some(a)) if a < f => Some(Marker::Action(a)),
        (Some(f), _) => Some(Marker::FinalAnswer(f)),
        (None, Some(a)) => Some(Marker::Action(a)),
        (None, None) => None,
    }
}

fn thought_before(text: &str) -> Option<String> {
    let text = text.trim();
    let text = text.strip_prefix(THOUGHT).unwrap_or(text).trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Classify a complete model output.
pub fn parse_turn(text: &str) -> ParsedTurn {
    match first_marker(text) {
        Some(Marker::FinalAnswer(pos)) => ParsedTurn::FinalAnswer {
            thought: thought_before(&text[..pos]),
            answer: text[pos + FINAL_ANSWER.len()..].trim().to_string(),
            marked: true,
        },
        Some(Marker::Action(pos)) => {
            let rest = &text[pos + ACTION.len()..];
            let (tool_line, after) = rest.split_once('\n').unwrap_or((rest, ""));
            let raw_arguments = match after.find(ACTION_INPUT) {
                Some(i) => {
                    let input = &after[i + ACTION_INPUT.len()..];
                    let input = input.find(OBSERVATION).map_or(input, |o| &input[..o]);
                    input.trim().to_string()
                }
                None => String::new(),
            };
            ParsedTurn::ToolCall {
                thought: thought_before(&text[..pos]),
                invocation: ToolInvocation {
                    tool_name: clean_tool_name(tool_line),
                    raw_arguments,
                },
            }
        }
        None => ParsedTurn::FinalAnswer {
            thought: None,
            answer: text.trim().to_string(),
            marked: false,
        },
    }
}

fn clean_tool_name(line: &str) -> String {
    line.trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '[' || c == ']')
        .trim()
        .to_string()
}

/// What the classifier has concluded about the turn being streamed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Undecided,
    FinalAnswer,
    ToolCall,
}

/// Decides, token by token, whether a streamed turn is a final answer, and
/// releases only the answer text for relaying.
///
/// Nothing is released before `Final Answer:` appears, so tool-call text
/// never reaches the caller. Leading and trailing whitespace of the answer
/// is never released, so the relayed bytes equal the parsed answer.
#[derive(Debug)]
pub struct TurnClassifier {
    buffer: String,
    state: Classification,
    released_to: usize,
    started: bool,
}

impl TurnClassifier {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            state: Classification::Undecided,
            released_to: 0,
            started: false,
        }
    }

    pub fn state(&self) -> Classification {
        self.state
    }

    /// True once some answer text has been released.
    pub fn has_released(&self) -> bool {
        self.started
    }

    /// Feed one token. Returns the answer text that may be relayed now.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.buffer.push_str(text);

        if self.state == Classification::Undecided {
            match first_marker(&self.buffer) {
                Some(Marker::FinalAnswer(pos)) => {
                    self.state = Classification::FinalAnswer;
                    self.released_to = pos + FINAL_ANSWER.len();
                }
                Some(Marker::Action(_)) => self.state = Classification::ToolCall,
                None => {}
            }
        }

        if self.state != Classification::FinalAnswer {
            return None;
        }

        let pending = &self.buffer[self.released_to..];
        let start = if self.started {
            self.released_to
        } else {
            self.buffer.len() - pending.trim_start().len()
        };
        // Trailing whitespace waits for the next visible token.
        let end = self.released_to + pending.trim_end().len();
        if end <= start {
            return None;
        }
        let out = self.buffer[start..end].to_string();
        self.started = true;
        self.released_to = end;
        Some(out)
    }

    pub fn finish(self) -> ParsedTurn {
        parse_turn(&self.buffer)
    }
}

impl Default for TurnClassifier {
    fn default() -> Self {
        Self::new()
    }
}
