//! Prompts for session extraction.
//!
//! All prompt text lives here so it can be changed without touching retry
//! or repair logic. Callers can override the system prompt via
//! [`crate::config::ExtractionConfig::system_prompt`]; the output schema
//! description is always appended to the user message.

use crate::record::{Field, NO_DATA};
use std::fmt::Write as _;

/// Default system prompt, used when `ExtractionConfig::system_prompt` is `None`.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert at extracting structured data from technical conference programs.

The text you receive contains one or more technical sessions. Each session shows:
- a session name (e.g. "Controls for Hybrids and Electric Powertrains Part 1 of 3")
- a session code (e.g. "PFL750")
- a room and a start time
- an overview paragraph describing the session
- organizers and chairpersons
- the presentations: time, paper number, title, authors and affiliations

Produce one record per presentation. A session without presentations (for
example a panel discussion) produces one record for the session itself.
"ORAL ONLY" is a valid paper number."#;

/// Describe the expected reply: a JSON array of flat objects with the
/// canonical keys.
pub fn output_schema() -> String {
    let mut s = String::from(
        "Reply with a JSON array of objects and nothing else. No code fences, no commentary.\n\
         Every object has exactly these string keys:\n",
    );
    for field in Field::ALL {
        let _ = writeln!(s, "- \"{}\": {}", field.as_str(), describe(field));
    }
    let _ = write!(
        s,
        "Every value is a string. Use \"{NO_DATA}\" when a value is not present in the text."
    );
    s
}

fn describe(field: Field) -> &'static str {
    match field {
        Field::SessionName => "session name",
        Field::SessionCode => "session code",
        Field::Overview => "the full overview paragraph of the session",
        Field::PaperNo => "paper number, e.g. \"2025-01-0042\" or \"ORAL ONLY\"",
        Field::Title => "presentation title (the session name for a session-only record)",
        Field::MainAuthorGroup => "main author name(s)",
        Field::MainAuthorAffiliation => "affiliation of the main author(s)",
        Field::CoAuthorGroup => "co-author names",
        Field::CoAuthorAffiliation => "affiliations of the co-authors",
        Field::Organizers => "organizer names with affiliations",
        Field::Chairperson => "chairperson names with affiliations",
    }
}

/// Instruction to reuse an overview resolved from an earlier unit.
pub fn overview_context(session_id: &str, overview: &str) -> String {
    format!(
        "This text continues session {session_id}. Its overview is already known; \
         use it verbatim as \"overview\" for every record of that session:\n\n\"\"\"{overview}\"\"\""
    )
}

/// The user message for one unit.
pub fn unit_prompt(text: &str) -> String {
    format!("{}\n\nText:\n'''\n{}\n'''", output_schema(), text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lists_every_field() {
        let schema = output_schema();
        for field in Field::ALL {
            assert!(schema.contains(&format!("\"{}\"", field.as_str())));
        }
        assert!(schema.contains("No data"));
    }

    #[test]
    fn unit_prompt_embeds_text() {
        let p = unit_prompt("Session Code ABC123");
        assert!(p.contains("Session Code ABC123"));
        assert!(p.starts_with("Reply with a JSON array"));
    }

    #[test]
    fn overview_context_names_session() {
        let c = overview_context("PFL750", "This session covers batteries.");
        assert!(c.contains("PFL750"));
        assert!(c.contains("This session covers batteries."));
    }
}
