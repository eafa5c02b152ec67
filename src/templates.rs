//! Fixed comment bodies posted by the bot.
//!
//! Comment templating proper lives outside the triage core; these are the
//! minimal bodies the reconciliation clauses need. Every body carries a
//! hidden marker line so previously posted boilerplate can be recognized by
//! the comment collaborator.

/// Marker prefix embedded in every bot-authored comment.
const MARKER: &str = "<!--- boilerplate: ";

fn with_marker(kind: &str, body: String) -> String {
    format!("{MARKER}{kind} --->\n{body}")
}

/// PR closed because its incoming repository no longer exists.
pub fn missing_ref(submitter: &str) -> String {
    with_marker(
        "incoming_ref_missing",
        format!(
            "@{submitter} the repository this pull request was submitted from no \
longer exists, so its branch can no longer be fetched or rebuilt. Closing; \
please resubmit from an existing fork."
        ),
    )
}

/// PR closed because it was opened from an upstream branch instead of a fork.
pub fn fork(submitter: &str) -> String {
    with_marker(
        "fork",
        format!(
            "@{submitter} pull requests must be submitted from a fork so the \
upstream repository does not accumulate contributor branches. Closing; please \
resubmit from a fork."
        ),
    )
}

/// Warn or close notice for an item stuck in needs_info.
pub fn needs_info_action(submitter: &str, action: &str, expire_days: u32) -> String {
    let body = match action {
        "close" => format!(
            "@{submitter} this item is still waiting on information and has now \
been inactive past the {expire_days} day limit, so it is being closed. Reply \
with the requested details to have it reopened."
        ),
        _ => format!(
            "@{submitter} this item is waiting on information from you. If none \
arrives it will be closed after {expire_days} days of inactivity."
        ),
    };
    with_marker("needs_info_base", body)
}

/// Status summary requested via the bot_status command.
pub fn bot_status(waiting_on: &str, is_needs_info: bool, is_needs_revision: bool) -> String {
    let mut body = String::from("**Bot status**\n\n");
    body.push_str(&format!("* waiting on: {waiting_on}\n"));
    body.push_str(&format!("* needs_info: {is_needs_info}\n"));
    body.push_str(&format!("* needs_revision: {is_needs_revision}\n"));
    with_marker("bot_status", body)
}

/// CI failure summary posted to the submitter.
pub fn ci_test_results(submitter: &str, results: &str) -> String {
    with_marker(
        "ci_test_results",
        format!(
            "@{submitter} the test run failed. The relevant output follows:\n\n\
<details><summary>Test output</summary>\n\n```\n{results}\n```\n</details>"
        ),
    )
}

/// Terminal notice for an item classified as unprocessable.
pub fn bad_item(submitter: &str, reason: &str) -> String {
    with_marker(
        "bad_item",
        format!(
            "@{submitter} this submission cannot be processed further: {reason}. \
It will not be triaged until the problem is corrected."
        ),
    )
}
