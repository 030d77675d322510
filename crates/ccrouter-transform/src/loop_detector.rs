//! Detection of repeated tool failures in the recent conversation.
//!
//! When the model keeps re-running a failing tool, a corrective hint is
//! appended to the outgoing request so the next turn breaks the loop.

use ccrouter_protocol::unified::{ContentPart, KnownContentPart, MessageContent, Role, UnifiedMessage};

const SCAN_WINDOW: usize = 20;
const EDIT_LOOP_THRESHOLD: usize = 2;
const ERROR_LOOP_THRESHOLD: usize = 3;

const EDIT_LOOP_MARKERS: &[&str] = &[
    "old_string and new_string are exactly the same",
    "No changes to make",
];

const ERROR_MARKERS: &[&str] = &[
    "Error:",
    "Error ",
    "error:",
    "ENOENT",
    "EACCES",
    "EPERM",
    "failed",
    "FAILED",
    "not found",
    "Permission denied",
    "Operation not permitted",
];

pub const EDIT_LOOP_HINT: &str = "IMPORTANT: Your last Edit/Update attempts failed because old_string and new_string were identical. Re-read the file to see its current contents before editing again. If the file already contains the desired text, do not edit it; continue with the next step instead.";

pub const ERROR_LOOP_HINT: &str = "IMPORTANT: You appear to be encountering repeated tool errors. Stop retrying the same failing operation. Re-read the relevant files to verify your assumptions, switch to a different non-destructive approach, or clearly tell the user what you attempted and that you cannot proceed.";

/// Scan the last messages for repeated tool failures and return the
/// corrective hint to inject, if any. Identical-string edit failures are
/// checked before the generic error heuristic.
pub fn detect_tool_loop(messages: &[UnifiedMessage]) -> Option<&'static str> {
    let window_start = messages.len().saturating_sub(SCAN_WINDOW);
    let mut edit_failures = 0usize;
    let mut generic_errors = 0usize;

    for message in &messages[window_start..] {
        if message.role != Role::Tool {
            continue;
        }
        let text = tool_result_text(message);
        if EDIT_LOOP_MARKERS.iter().any(|marker| text.contains(marker)) {
            edit_failures += 1;
        }
        if ERROR_MARKERS.iter().any(|marker| text.contains(marker)) {
            generic_errors += 1;
        }
    }

    if edit_failures >= EDIT_LOOP_THRESHOLD {
        return Some(EDIT_LOOP_HINT);
    }
    if generic_errors >= ERROR_LOOP_THRESHOLD {
        return Some(ERROR_LOOP_HINT);
    }
    None
}

fn tool_result_text(message: &UnifiedMessage) -> String {
    match &message.content {
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Known(KnownContentPart::Text { text, .. }) => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            texts.join(" ")
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_message(text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: Role::Tool,
            content: Some(MessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: Some("call_1".to_string()),
            thinking: None,
        }
    }

    #[test]
    fn no_hint_for_healthy_conversation() {
        let messages = vec![
            UnifiedMessage::text(Role::User, "hello"),
            tool_message("file written"),
        ];
        assert_eq!(detect_tool_loop(&messages), None);
    }

    #[test]
    fn two_identical_edit_failures_trigger_edit_hint() {
        let messages = vec![
            tool_message("old_string and new_string are exactly the same"),
            tool_message("No changes to make"),
        ];
        assert_eq!(detect_tool_loop(&messages), Some(EDIT_LOOP_HINT));
    }

    #[test]
    fn single_edit_failure_is_below_threshold() {
        let messages = vec![tool_message("No changes to make")];
        assert_eq!(detect_tool_loop(&messages), None);
    }

    #[test]
    fn three_generic_errors_trigger_generic_hint() {
        let messages = vec![
            tool_message("ENOENT: no such file or directory"),
            tool_message("Error: command failed"),
            tool_message("Permission denied"),
        ];
        assert_eq!(detect_tool_loop(&messages), Some(ERROR_LOOP_HINT));
    }

    #[test]
    fn edit_hint_takes_precedence_over_generic() {
        // Edit failures also match the generic "failed" marker; the edit
        // hint must win.
        let messages = vec![
            tool_message("Edit failed: old_string and new_string are exactly the same"),
            tool_message("Edit failed: old_string and new_string are exactly the same"),
            tool_message("Error: something else"),
        ];
        assert_eq!(detect_tool_loop(&messages), Some(EDIT_LOOP_HINT));
    }

    #[test]
    fn failures_outside_window_are_ignored() {
        let mut messages: Vec<UnifiedMessage> = vec![
            tool_message("Error: boom"),
            tool_message("Error: boom"),
            tool_message("Error: boom"),
        ];
        for _ in 0..SCAN_WINDOW {
            messages.push(UnifiedMessage::text(Role::User, "carry on"));
        }
        assert_eq!(detect_tool_loop(&messages), None);
    }

    #[test]
    fn array_content_text_fields_are_joined() {
        let message = UnifiedMessage {
            role: Role::Tool,
            content: Some(MessageContent::Parts(vec![
                ContentPart::text("old_string and new_string"),
                ContentPart::text("are exactly the same"),
            ])),
            tool_calls: None,
            tool_call_id: Some("call_2".to_string()),
            thinking: None,
        };
        // Joined with spaces, the marker spans the two text parts.
        assert_eq!(detect_tool_loop(&[message.clone()]), None);
        assert_eq!(
            detect_tool_loop(&[
                message,
                tool_message("old_string and new_string are exactly the same"),
            ]),
            Some(EDIT_LOOP_HINT)
        );
    }
}
