use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::ConversationHistory;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Thought,
    ToolCall,
    Observation,
    FinalAnswer,
}

/// A tool call parsed out of model output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub raw_arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Invocation(ToolInvocation),
}

/// One immutable step of the reasoning loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    kind: TurnKind,
    content: TurnContent,
    sequence: u64,
    created_at: DateTime<Utc>,
}

impl Turn {
    pub fn kind(&self) -> TurnKind {
        self.kind
    }

    pub fn content(&self) -> &TurnContent {
        &self.content
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text(t) => Some(t),
            TurnContent::Invocation(_) => None,
        }
    }

    pub fn invocation(&self) -> Option<&ToolInvocation> {
        match &self.content {
            TurnContent::Invocation(inv) => Some(inv),
            TurnContent::Text(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("turn out of order: cannot append {attempted:?} after {previous:?}")]
    OutOfOrder {
        previous: Option<TurnKind>,
        attempted: TurnKind,
    },
}

/// Append-only history of one request: goal, carried-in conversation, turns.
#[derive(Clone, Debug)]
pub struct Context {
    goal: String,
    history: ConversationHistory,
    turns: Vec<Turn>,
    next_sequence: u64,
}

impl Context {
    pub fn new(goal: impl Into<String>, history: ConversationHistory) -> Self {
        Self {
            goal: goal.into(),
            history,
            turns: Vec::new(),
            next_sequence: 1,
        }
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last_kind(&self) -> Option<TurnKind> {
        self.turns.last().map(|t| t.kind)
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.kind == TurnKind::FinalAnswer)
            .and_then(Turn::text)
    }

    pub fn count(&self, kind: TurnKind) -> usize {
        self.turns.iter().filter(|t| t.kind == kind).count()
    }

    pub fn push_thought(&mut self, text: impl Into<String>) -> Result<&Turn, ContextError> {
        self.append(TurnKind::Thought, TurnContent::Text(text.into()))
    }

    pub fn push_tool_call(&mut self, invocation: ToolInvocation) -> Result<&Turn, ContextError> {
        self.append(TurnKind::ToolCall, TurnContent::Invocation(invocation))
    }

    pub fn push_observation(&mut self, text: impl Into<String>) -> Result<&Turn, ContextError> {
        self.append(TurnKind::Observation, TurnContent::Text(text.into()))
    }

    pub fn push_final_answer(&mut self, text: impl Into<String>) -> Result<&Turn, ContextError> {
        self.append(TurnKind::FinalAnswer, TurnContent::Text(text.into()))
    }

    fn append(&mut self, kind: TurnKind, content: TurnContent) -> Result<&Turn, ContextError> {
        let previous = self.last_kind();
        let allowed = match previous {
            Some(TurnKind::FinalAnswer) => false,
            Some(TurnKind::ToolCall) => kind == TurnKind::Observation,
            _ => kind != TurnKind::Observation,
        };
        if !allowed {
            return Err(ContextError::OutOfOrder {
                previous,
                attempted: kind,
            });
        }

        let turn = Turn {
            kind,
            content,
            sequence: self.next_sequence,
            created_at: Utc::now(),
        };
        self.next_sequence += 1;
        self.turns.push(turn);
        Ok(&self.turns[self.turns.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> ToolInvocation {
        ToolInvocation {
            tool_name: "calculator".into(),
            raw_arguments: "2^8".into(),
        }
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut ctx = Context::new("goal", ConversationHistory::new());
        ctx.push_thought("think").unwrap();
        ctx.push_tool_call(invocation()).unwrap();
        ctx.push_observation("256").unwrap();
        ctx.push_final_answer("done").unwrap();

        let seqs: Vec<u64> = ctx.turns().iter().map(Turn::sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(ctx.last_kind(), Some(TurnKind::FinalAnswer));
        assert_eq!(ctx.final_answer(), Some("done"));
    }

    #[test]
    fn tool_call_must_be_followed_by_observation() {
        let mut ctx = Context::new("goal", ConversationHistory::new());
        ctx.push_tool_call(invocation()).unwrap();
        assert_eq!(ctx.last_kind(), Some(TurnKind::ToolCall));

        let err = ctx.push_tool_call(invocation()).unwrap_err();
        assert_eq!(
            err,
            ContextError::OutOfOrder {
                previous: Some(TurnKind::ToolCall),
                attempted: TurnKind::ToolCall,
            }
        );
        assert!(ctx.push_final_answer("x").is_err());
        assert!(ctx.push_thought("x").is_err());
        ctx.push_observation("ok").unwrap();
        assert_eq!(ctx.last_kind(), Some(TurnKind::Observation));
    }

    #[test]
    fn observation_requires_pending_tool_call() {
        let mut ctx = Context::new("goal", ConversationHistory::new());
        assert!(ctx.push_observation("orphan").is_err());
        ctx.push_tool_call(invocation()).unwrap();
        ctx.push_observation("one").unwrap();
        assert!(ctx.push_observation("two").is_err());
    }

    #[test]
    fn nothing_after_final_answer() {
        let mut ctx = Context::new("goal", ConversationHistory::new());
        ctx.push_final_answer("done").unwrap();
        assert!(ctx.push_thought("more").is_err());
        assert_eq!(ctx.turns().len(), 1);
    }

    #[test]
    fn rejected_turn_does_not_consume_sequence() {
        let mut ctx = Context::new("goal", ConversationHistory::new());
        assert!(ctx.push_observation("orphan").is_err());
        let turn = ctx.push_thought("first").unwrap();
        assert_eq!(turn.sequence(), 1);
    }

    #[test]
    fn accessors() {
        let mut ctx = Context::new("What is 2^8?", ConversationHistory::new());
        let turn = ctx.push_tool_call(invocation()).unwrap();
        assert_eq!(turn.kind(), TurnKind::ToolCall);
        assert!(turn.text().is_none());
        assert_eq!(turn.invocation().unwrap().tool_name, "calculator");
        assert_eq!(ctx.goal(), "What is 2^8?");
        assert_eq!(ctx.count(TurnKind::ToolCall), 1);
        assert!(ctx.final_answer().is_none());
    }
}
