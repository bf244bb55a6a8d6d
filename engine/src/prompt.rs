//! Prompt assembly.

use yijing_types::{ClientContext, HexagramContext, Question, Throw, UserName};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an I Ching divination master. \
Treat the hexagram, judgment and line texts provided as your primary evidence. \
Write in Traditional Chinese, practical and specific, and never invent classical text that was not provided.";

/// Everything that goes into the user prompt besides the hexagram itself.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub question: &'a Question,
    pub user_name: Option<&'a UserName>,
    pub client: Option<&'a ClientContext>,
}

fn format_throws<'a>(throws: impl Iterator<Item = &'a Throw>) -> String {
    let values: Vec<String> = throws.map(ToString::to_string).collect();
    format!("[{}]", values.join(", "))
}

#[must_use]
pub fn build_user_prompt(context: &HexagramContext, inputs: PromptInputs<'_>) -> String {
    let figure = context.figure();
    let polarity = figure.top_down_polarity();

    let mut parts = vec![
        format!("Question: {}", inputs.question),
        format!("Throws (bottom line first): {}", format_throws(figure.throws().iter())),
        format!("Throws (top line first): {}", format_throws(figure.throws().iter().rev())),
        format!(
            "Top-down yin/yang: {} {}",
            polarity[..3].join(" "),
            polarity[3..].join(" ")
        ),
        format!("Upper trigram: {}", figure.upper_trigram()),
        format!("Lower trigram: {}", figure.lower_trigram()),
        format!("Hexagram: {}", context.name()),
        format!("Hexagram code: {}", context.code()),
        format!("Judgment: {}", context.judgment()),
    ];

    let positions = context.changing_positions();
    if positions.is_empty() {
        parts.push("Changing lines: none".to_string());
    } else {
        parts.push(format!("Changing line positions: {positions:?}"));
        parts.push(format!(
            "Changing line names: {}",
            figure.changing_line_labels().join(", ")
        ));
        if context.line_texts().is_empty() {
            parts.push("Changing line texts: none found".to_string());
        } else {
            parts.push("Changing line texts:".to_string());
            for line in context.line_texts() {
                parts.push(format!("- {}: {}", line.position, line.text));
            }
        }
    }

    if let Some(name) = inputs.user_name {
        parts.push(format!("User name: {}", name.as_str()));
    }
    if let Some(client) = inputs.client {
        match &client.version {
            Some(version) => parts.push(format!("Client: {} {version}", client.app.as_str())),
            None => parts.push(format!("Client: {}", client.app.as_str())),
        }
    }

    parts.push("Please provide: overall reading, key risks, and 3 actionable suggestions.".to_string());
    parts.join("\n")
}
