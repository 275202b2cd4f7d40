//! Status vocabulary mapping between internal statuses and external
//! board columns.
//!
//! Boards name their columns freely ("To Do", "Doing", "Won't Fix");
//! matching is case- and punctuation-insensitive over a synonym table,
//! with documented fallbacks when a board lacks a column: in-review
//! falls back to in-progress, cancelled falls back to done.

use bosun_db::models::TaskStatus;

/// Synonyms for each internal status, in canonical spelling.
fn synonyms(status: TaskStatus) -> &'static [&'static str] {
    match status {
        TaskStatus::Todo => &["Todo", "To Do", "Backlog", "Queued"],
        TaskStatus::InProgress => &["In Progress", "Doing", "Active"],
        TaskStatus::InReview => &["In Review", "Review", "Needs Review", "Ready for Review"],
        TaskStatus::Done => &["Done", "Complete", "Closed"],
        TaskStatus::Cancelled => &["Cancelled", "Canceled", "Abandoned", "Won't Fix"],
        // `failed` has no board column; a failed task stays in progress
        // on the board until it is retried or cancelled.
        TaskStatus::Failed => &["In Progress", "Doing", "Active"],
    }
}

/// Normalize for comparison: lowercase, alphanumerics only.
fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Find the board option matching an internal status.
fn direct_match<'o>(options: &'o [String], status: TaskStatus) -> Option<&'o str> {
    let wanted: Vec<String> = synonyms(status).iter().map(|s| normalize(s)).collect();
    options
        .iter()
        .find(|option| wanted.contains(&normalize(option)))
        .map(|s| s.as_str())
}

/// Match an internal status against the board's options, applying the
/// documented fallbacks when the board lacks a column.
pub fn match_status_option<'o>(options: &'o [String], status: TaskStatus) -> Option<&'o str> {
    if let Some(found) = direct_match(options, status) {
        return Some(found);
    }
    match status {
        TaskStatus::InReview => direct_match(options, TaskStatus::InProgress),
        TaskStatus::Cancelled => direct_match(options, TaskStatus::Done),
        _ => None,
    }
}

/// Reverse mapping: interpret a board column name as an internal status.
pub fn parse_external_status(option: &str) -> Option<TaskStatus> {
    let normalized = normalize(option);
    for status in [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Done,
        TaskStatus::Cancelled,
    ] {
        if synonyms(status)
            .iter()
            .any(|syn| normalize(syn) == normalized)
        {
            return Some(status);
        }
    }
    None
}
