//! Message Validator.
//!
//! Checks a message sequence against a [`ChatRestrictions`] set and, when the
//! sequence is invalid, builds a best-effort repaired copy. Every change the
//! repair makes is recorded in `applied_fixes`.
//!
//! A restriction that is `None` is not checked at all.

use tracing::debug;

use super::{ChatRestrictions, Message, Role, ValidationResult};

/// Synthetic user turn used to keep a conversation well-formed.
pub const USER_FILLER: &str = "Please continue.";

/// Synthetic assistant turn inserted between two consecutive user turns.
pub const ASSISTANT_FILLER: &str = "Continue.";

/// Validates `messages` against `restrictions`.
///
/// Errors are collected on the original sequence. When at least one error is
/// found, the repair passes run in a fixed order (empty content, system
/// placement, turn alternation, final user turn) and the result carries the
/// repaired sequence in `suggested_fixes`.
pub fn validate(messages: &[Message], restrictions: &ChatRestrictions) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_empty(messages, restrictions, &mut errors, &mut warnings);
    check_system_placement(messages, restrictions, &mut errors);
    if restrictions.alternating_turns == Some(true) {
        check_alternation(messages, &mut errors);
    }
    if restrictions.requires_user_last == Some(true) {
        check_user_last(messages, &mut errors);
    }

    if errors.is_empty() {
        return ValidationResult {
            valid: true,
            warnings,
            ..Default::default()
        };
    }

    let (fixed, applied_fixes) = repair(messages, restrictions);
    debug!(
        "Validation found {} error(s), repair applied {} fix(es)",
        errors.len(),
        applied_fixes.len()
    );

    ValidationResult {
        valid: false,
        errors,
        warnings,
        suggested_fixes: (!applied_fixes.is_empty()).then_some(fixed),
        applied_fixes,
    }
}

// ── Checks ───────────────────────────────────────────────

fn check_empty(
    messages: &[Message],
    restrictions: &ChatRestrictions,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let Some(allowed) = restrictions.allow_empty_messages else {
        return;
    };
    for (i, msg) in messages.iter().enumerate().filter(|(_, m)| m.is_empty()) {
        let text = format!("Message {i} ({}) has empty content", msg.role);
        if allowed {
            warnings.push(text);
        } else {
            errors.push(format!("{text}, which this model does not accept"));
        }
    }
}

fn check_system_placement(
    messages: &[Message],
    restrictions: &ChatRestrictions,
    errors: &mut Vec<String>,
) {
    let system_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::System)
        .map(|(i, _)| i)
        .collect();

    if restrictions.single_system_at_start == Some(true) {
        if system_positions.len() > 1 {
            errors.push(format!(
                "Found {} system messages, only a single leading system message is allowed",
                system_positions.len()
            ));
        } else if let Some(&pos) = system_positions.first() {
            if pos != 0 {
                errors.push(format!(
                    "System message at position {pos} must be the first message"
                ));
            }
        }
    }

    if let Some(max) = restrictions.max_system_messages {
        let count = system_positions.len();
        if count > max as usize {
            errors.push(format!(
                "Found {count} system message(s), at most {max} allowed"
            ));
        }
    }
}

fn check_alternation(messages: &[Message], errors: &mut Vec<String>) {
    let mut previous: Option<(usize, Role)> = None;
    for (i, msg) in messages.iter().enumerate() {
        if msg.role == Role::System {
            continue;
        }
        if let Some((prev_i, prev_role)) = previous {
            if prev_role == msg.role {
                errors.push(format!(
                    "Consecutive {} messages at positions {prev_i} and {i}, turns must alternate",
                    msg.role
                ));
            }
        }
        previous = Some((i, msg.role));
    }
}

fn check_user_last(messages: &[Message], errors: &mut Vec<String>) {
    match messages.last() {
        Some(last) if last.role == Role::User => {}
        Some(last) => errors.push(format!(
            "Last message has role {}, the sequence must end with a user message",
            last.role
        )),
        None => errors.push("Empty sequence, the sequence must end with a user message".to_string()),
    }
}

// ── Repairs ──────────────────────────────────────────────

fn repair(messages: &[Message], restrictions: &ChatRestrictions) -> (Vec<Message>, Vec<String>) {
    let mut fixed = messages.to_vec();
    let mut applied = Vec::new();

    if restrictions.allow_empty_messages == Some(false) {
        applied.extend(drop_empty(&mut fixed));
    }
    applied.extend(consolidate_system(&mut fixed, restrictions));
    let alternating = restrictions.alternating_turns == Some(true);
    if alternating {
        applied.extend(insert_missing_turns(&mut fixed));
    }
    if restrictions.requires_user_last == Some(true) {
        if let Some(fix) = ensure_user_last(&mut fixed) {
            applied.push(fix);
            // A trailing system message can hide a user turn from the append
            if alternating {
                applied.extend(insert_missing_turns(&mut fixed));
            }
        }
    }

    (fixed, applied)
}

fn drop_empty(messages: &mut Vec<Message>) -> Option<String> {
    let before = messages.len();
    messages.retain(|m| !m.is_empty());
    let removed = before - messages.len();
    (removed > 0).then(|| {
        format!("Removed {removed} empty message(s) because empty content is rejected")
    })
}

fn consolidate_system(
    messages: &mut Vec<Message>,
    restrictions: &ChatRestrictions,
) -> Option<String> {
    let count = messages.iter().filter(|m| m.role == Role::System).count();
    if count == 0 {
        return None;
    }

    let misplaced = messages.first().map(|m| m.role) != Some(Role::System) || count > 1;
    let single_violated = restrictions.single_system_at_start == Some(true) && misplaced;
    let max = restrictions.max_system_messages;
    let max_violated = max.is_some_and(|m| count > m as usize);

    if !single_violated && !max_violated {
        return None;
    }

    let combined = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    messages.retain(|m| m.role != Role::System);

    if max == Some(0) {
        match messages.iter_mut().find(|m| m.role == Role::User) {
            Some(first_user) => {
                first_user.content = format!("{combined}\n\n{}", first_user.content);
            }
            None => messages.insert(0, Message::user(combined)),
        }
        return Some(format!(
            "Folded {count} system message(s) into the first user message because the system role is not accepted"
        ));
    }

    messages.insert(0, Message::system(combined));
    Some(if count == 1 {
        "Moved the system message to the start of the sequence".to_string()
    } else {
        format!("Merged {count} system messages into a single leading system message")
    })
}

fn insert_missing_turns(messages: &mut Vec<Message>) -> Option<String> {
    let mut out = Vec::with_capacity(messages.len());
    let mut previous: Option<Role> = None;
    let mut inserted = 0;

    for msg in messages.drain(..) {
        if msg.role != Role::System {
            if previous == Some(msg.role) {
                out.push(match msg.role {
                    Role::User => Message::assistant(ASSISTANT_FILLER),
                    _ => Message::user(USER_FILLER),
                });
                inserted += 1;
            }
            previous = Some(msg.role);
        }
        out.push(msg);
    }
    *messages = out;

    (inserted > 0).then(|| {
        format!("Inserted {inserted} synthetic turn(s) so user and assistant messages alternate")
    })
}

fn ensure_user_last(messages: &mut Vec<Message>) -> Option<String> {
    if messages.last().map(|m| m.role) == Some(Role::User) {
        return None;
    }
    messages.push(Message::user(USER_FILLER));
    Some("Appended a user message because the sequence must end with a user turn".to_string())
}
