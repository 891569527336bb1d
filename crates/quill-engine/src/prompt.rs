use std::fmt::Write;

use quill_core::conversation::Role;
use quill_core::tools::ToolDefinition;
use quill_core::turns::{Context, TurnContent, TurnKind};

use crate::protocol::{ACTION, ACTION_INPUT, FINAL_ANSWER, OBSERVATION, THOUGHT};

/// Render the full generation prompt: instructions, tool list, prior
/// conversation, the goal, and the turns taken so far.
pub fn build_prompt(context: &Context, tools: &[ToolDefinition]) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str("Answer the following question as best you can. You have access to the following tools:\n\n");
    for tool in tools {
        let _ = writeln!(
            prompt,
            "{}: {} (input: {})",
            tool.name,
            tool.description,
            tool.input_schema.describe()
        );
    }
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

    let _ = write!(
        prompt,
        "\nUse the following format:\n\n\
         Question: the input question you must answer\n\
         {THOUGHT} you should always think about what to do\n\
         {ACTION} the action to take, should be one of [{}]\n\
         {ACTION_INPUT} the input to the action\n\
         {OBSERVATION} the result of the action\n\
         ... (this Thought/Action/Action Input/Observation can repeat N times)\n\
         {THOUGHT} I now know the final answer\n\
         {FINAL_ANSWER} the final answer to the original input question\n\n\
         Begin!\n",
        names.join(", ")
    );

    let history = context.history();
    if !history.is_empty() {
        prompt.push_str("\nPrevious conversation:\n");
        for entry in &history.entries {
            let speaker = match entry.role {
                Role::User => "Human",
                Role::Assistant => "Assistant",
            };
            let _ = writeln!(prompt, "{speaker}: {}", entry.text);
        }
    }

    let _ = write!(prompt, "\nQuestion: {}\n", context.goal());
    prompt.push_str(&scratchpad(context));
    prompt.push_str(THOUGHT);
    prompt
}

/// Turns taken so far, in the same text format the model writes.
pub fn scratchpad(context: &Context) -> String {
    let mut pad = String::new();
    for turn in context.turns() {
        match (turn.kind(), turn.content()) {
            (TurnKind::Thought, TurnContent::Text(text)) => {
                let _ = writeln!(pad, "{THOUGHT} {text}");
            }
            (TurnKind::ToolCall, TurnContent::Invocation(call)) => {
                let _ = writeln!(pad, "{ACTION} {}", call.tool_name);
                let _ = writeln!(pad, "{ACTION_INPUT} {}", call.raw_arguments);
            }
            (TurnKind::Observation, TurnContent::Text(text)) => {
                let _ = writeln!(pad, "{OBSERVATION} {text}");
            }
            (TurnKind::FinalAnswer, TurnContent::Text(text)) => {
                let _ = writeln!(pad, "{FINAL_ANSWER} {text}");
            }
            _ => {}
        }
    }
    pad
}
