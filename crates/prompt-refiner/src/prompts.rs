//! System prompt constants for each refinement stage, plus the builder for
//! the generator's composite instruction.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes
//! so checkpoints and logs can be tied to the wording that produced them.

use crate::retrieval::TemplateMatch;

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Analyzer preamble. The reply becomes `user_intent` verbatim.
pub const ANALYZER_PREAMBLE: &str = "\
You are a prompt analyst. Read the user's prompt and describe, in a few sentences, \
what they are actually trying to achieve.

Cover:
- the task type (writing, coding, analysis, role-play, data extraction, ...)
- the intended audience and output format, when they can be inferred
- constraints or quality expectations the prompt states or implies
- anything ambiguous that a better prompt should pin down

Reply with the analysis only. Do not rewrite the prompt.";

/// Generator preamble. The reply is streamed to the caller and becomes
/// `improved_text` verbatim.
pub const GENERATOR_PREAMBLE: &str = "\
You are a senior prompt engineer. Rewrite the user's prompt into a production-grade \
prompt that an LLM can follow without guessing.

A strong prompt states the role, the task, the relevant context, explicit constraints, \
the expected output format, and how success is judged. Keep the user's intent intact; \
do not invent requirements they did not ask for.

When a reference template is provided, borrow its structure where it fits. \
When reviewer feedback is provided, address every point of it.

Reply with the improved prompt only, with no preface or explanation.";

/// Reflector preamble. Format instructions for the verdict are appended at
/// call time.
pub const REFLECTOR_PREAMBLE: &str = "\
You are a strict prompt reviewer. Evaluate the prompt you are given for clarity, \
completeness, structure, and whether an LLM could execute it reliably.

Write a concise critique listing concrete improvements. Set is_complete to true only \
when the prompt is already at a professional standard and further revision would not \
materially improve it.";

/// Header placed above a retrieved reference template.
pub const TEMPLATE_HEADER: &str = "[Reference template from the prompt library]";

const NO_TEMPLATE: &str = "No matching reference template was found.";

/// Build the user turn for a Generate pass.
pub fn build_generation_brief(
    original_text: &str,
    user_intent: &str,
    critique: &str,
    template: Option<&TemplateMatch>,
) -> String {
    let mut brief = format!("Intent:\n{user_intent}\n\nOriginal prompt:\n{original_text}\n\n");

    match template {
        Some(m) => {
            brief.push_str(TEMPLATE_HEADER);
            brief.push_str(&format!(" ({})\n{}\n", m.label, m.template));
        }
        None => {
            brief.push_str(NO_TEMPLATE);
            brief.push('\n');
        }
    }

    if !critique.trim().is_empty() {
        brief.push_str(&format!(
            "\nReviewer feedback on the previous draft:\n{}\n",
            critique.trim()
        ));
    }

    brief
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_template() -> TemplateMatch {
        TemplateMatch {
            label: "business email".into(),
            template: "Role: ...\nTask: ...".into(),
            score: 0.82,
        }
    }

    #[test]
    fn first_round_brief_has_no_feedback_section() {
        let brief = build_generation_brief("write an email", "ask for a raise", "", None);
        assert!(brief.contains("Original prompt:\nwrite an email"));
        assert!(brief.contains("Intent:\nask for a raise"));
        assert!(brief.contains(NO_TEMPLATE));
        assert!(!brief.contains("Reviewer feedback"));
    }

    #[test]
    fn brief_includes_template_and_critique() {
        let template = email_template();
        let brief = build_generation_brief(
            "write an email",
            "ask for a raise",
            "  specify tone  ",
            Some(&template),
        );
        assert!(brief.contains(TEMPLATE_HEADER));
        assert!(brief.contains("(business email)"));
        assert!(brief.contains("Role: ..."));
        assert!(brief.contains("Reviewer feedback on the previous draft:\nspecify tone\n"));
        assert!(!brief.contains(NO_TEMPLATE));
    }

    #[test]
    fn preambles_are_not_empty() {
        for preamble in [ANALYZER_PREAMBLE, GENERATOR_PREAMBLE, REFLECTOR_PREAMBLE] {
            assert!(preamble.len() > 100);
        }
    }
}
