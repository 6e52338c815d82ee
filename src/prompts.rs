//! Prompt assembly for the decide loop, synthesis and the fast path
//!
//! Every builder is a pure function of its inputs; the date is passed in
//! rather than read from the clock so prompts are reproducible.

use crate::history::{ConversationMessage, HistoryWindow};
use crate::models::{ToolObservation, ToolSchema, UserProfileSummary};
use chrono::NaiveDate;

const DISCLAIMER: &str = "This is not financial advice. Consult a qualified professional.";

#[derive(Debug, Clone, Copy, Default)]
pub struct PromptAssembler {
    window: HistoryWindow,
}

/// Everything the decision prompt is built from.
pub struct DecisionContext<'a> {
    pub query: &'a str,
    pub history: &'a [ConversationMessage],
    pub profile: &'a UserProfileSummary,
    pub schemas: &'a [ToolSchema],
    pub outputs: &'a [ToolObservation],
    pub feedback: &'a [String],
    pub today: NaiveDate,
}

/// Everything the synthesis prompt is built from.
pub struct SynthesisContext<'a> {
    pub query: &'a str,
    pub history: &'a [ConversationMessage],
    pub profile: &'a UserProfileSummary,
    pub outputs: &'a [ToolObservation],
    /// Answer the model already gave during DECIDE, if any.
    pub draft: Option<&'a str>,
    pub today: NaiveDate,
}

impl PromptAssembler {
    pub fn new(window: HistoryWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> HistoryWindow {
        self.window
    }

    /// Prompt asking the model to either call exactly one tool or answer.
    pub fn build_decision_prompt(&self, ctx: &DecisionContext<'_>) -> String {
        let tools = if ctx.schemas.is_empty() {
            "(no tools are available; answer directly)".to_string()
        } else {
            ctx.schemas
                .iter()
                .map(|s| s.to_prompt_json().to_string())
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut prompt = format!(
            r#"You are an expert financial assistant that can look up real-time data.
Today's Date: {}

USER PROFILE:
{}

CONVERSATION SO FAR:
{}

AVAILABLE TOOLS (JSON schemas):
{}

DATA GATHERED SO FAR:
{}
"#,
            ctx.today.format("%Y-%m-%d"),
            ctx.profile.render(),
            self.window.render(ctx.history),
            tools,
            render_outputs(ctx.outputs),
        );

        if !ctx.feedback.is_empty() {
            prompt.push_str("\nCORRECTIONS (read carefully before deciding):\n");
            for note in ctx.feedback {
                prompt.push_str("- ");
                prompt.push_str(note);
                prompt.push('\n');
            }
        }

        prompt.push_str(&format!(
            r#"
USER QUESTION:
{}

Decide the single next step.
Rules:
- If you need data you do not have yet, reply with ONLY one JSON object:
  {{"tool": "<tool name>", "arguments": {{ ... }}}}
- Use only the tools listed above and only their declared parameters
- Never repeat a call whose result is already in DATA GATHERED SO FAR
- If you can already answer, reply in plain prose with no JSON
"#,
            ctx.query.trim()
        ));

        prompt
    }

    /// Tool-free prompt that turns gathered data into the user-facing answer.
    pub fn build_synthesis_prompt(&self, ctx: &SynthesisContext<'_>) -> String {
        let data = if ctx.outputs.is_empty() {
            "No specific external data was retrieved for this question. Answer from general \
             knowledge or the user's profile if relevant, and say so."
                .to_string()
        } else {
            render_outputs(ctx.outputs)
        };

        let draft = ctx
            .draft
            .map(|d| format!("\nDRAFT ANSWER (refine it, keep facts unchanged):\n{}\n", d.trim()))
            .unwrap_or_default();

        format!(
            r#"You are an expert financial assistant chatbot.
Today's Date: {}

USER PROFILE:
{}

CONVERSATION SO FAR:
{}

RELEVANT DATA:
{}
{}
USER QUESTION:
{}

Instructions:
- Answer the question directly using the data above; do not make up numbers
- Carefully consider the user's profile when formulating any advice
- Do not mention tools, functions, function calls, JSON or any internal processing
- If providing investment opinions, ALWAYS include a disclaimer: "{}"
- Be clear, concise, and helpful
"#,
            ctx.today.format("%Y-%m-%d"),
            ctx.profile.render(),
            self.window.render(ctx.history),
            data,
            draft,
            ctx.query.trim(),
            DISCLAIMER,
        )
    }

    /// One-shot prompt for conversational queries on the fast path.
    pub fn build_fast_prompt(&self, query: &str, history: &[ConversationMessage]) -> String {
        format!(
            r#"You are a friendly financial assistant chatbot.

CONVERSATION SO FAR:
{}

USER MESSAGE:
{}

Reply briefly and naturally. Offer help with markets or portfolios if it fits.
"#,
            self.window.render(history),
            query.trim()
        )
    }
}

fn render_outputs(outputs: &[ToolObservation]) -> String {
    if outputs.is_empty() {
        return "(nothing yet)".to_string();
    }

    outputs
        .iter()
        .enumerate()
        .map(|(i, o)| format!("[{}] {}\n{}", i + 1, o.signature, o.output_text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
