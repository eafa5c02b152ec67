//! Comment command vocabulary and precedence.
//!
//! Maintainers and submitters drive close/merge/label behavior through a
//! fixed, closed set of textual commands. A command can be negated with a
//! leading `!`; for each negatable pair only the latest chronological
//! occurrence decides whether the command is active.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use tracing::warn;

use crate::item::CommandEvent;

/// The closed command vocabulary, positive forms only.
pub const COMMAND_VOCABULARY: &[&str] = &[
    "needs_info",
    "notabug",
    "bot_status",
    "bot_broken",
    "bot_skip",
    "wontfix",
    "bug_resolved",
    "resolved_by_pr",
    "needs_contributor",
    "needs_rebase",
    "needs_revision",
    "shipit",
    "duplicate_of",
    "close_me",
];

/// Commands that accept a `!` negation.
const NEGATABLE: &[&str] = &[
    "needs_info",
    "bot_broken",
    "bot_skip",
    "needs_contributor",
    "needs_rebase",
    "needs_revision",
    "shipit",
];

pub fn is_known_command(name: &str) -> bool {
    COMMAND_VOCABULARY.contains(&name)
}

pub fn is_negatable(name: &str) -> bool {
    NEGATABLE.contains(&name)
}

/// Resolve the active command set from a chronological command log.
///
/// When `actors` is given, events from other actors are ignored. For a
/// negatable pair the latest of `cmd`/`!cmd` wins: a trailing negation leaves
/// neither active. Non-negatable commands are active once seen.
pub fn active_commands(
    events: &[CommandEvent],
    actors: Option<&BTreeSet<String>>,
) -> BTreeSet<String> {
    // latest verdict per command name: true = active
    let mut verdicts: BTreeMap<String, bool> = BTreeMap::new();

    for event in events {
        if let Some(allowed) = actors {
            if !allowed.contains(&event.actor) {
                continue;
            }
        }
        let word = event.command();
        let (name, positive) = match word.strip_prefix('!') {
            Some(base) => (base, false),
            None => (word, true),
        };
        if !is_known_command(name) {
            continue;
        }
        if !positive && !is_negatable(name) {
            continue;
        }
        // events are chronological, so a plain overwrite keeps the latest
        verdicts.insert(name.to_string(), positive);
    }

    verdicts
        .into_iter()
        .filter_map(|(name, active)| active.then_some(name))
        .collect()
}

/// The most recent event for the given command, respecting the actor filter.
pub fn latest_command_event<'a>(
    events: &'a [CommandEvent],
    command: &str,
    actors: Option<&BTreeSet<String>>,
) -> Option<&'a CommandEvent> {
    events
        .iter()
        .rev()
        .filter(|e| match actors {
            Some(allowed) => allowed.contains(&e.actor),
            None => true,
        })
        .find(|e| e.command() == command)
}

/// Extract the referenced PR number from a `resolved_by_pr` token.
///
/// Only the most recent matching command is ever inspected; a token that
/// fails to parse is logged and skipped, with no fallback to earlier
/// occurrences.
pub fn extract_pr_number(token: &str) -> Option<u64> {
    let re = Regex::new(r"(\d+)").ok()?;
    let rest = token
        .split_whitespace()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    match re.captures(&rest).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().parse().ok(),
        None => {
            warn!(token, "invalid resolved_by_pr command, skipping");
            None
        }
    }
}
