//! Subject naming: `{prefix}.{category}.{key}`.
//!
//! Tokens are separated by `.`. In subscription patterns `*` matches exactly
//! one token and `>` (last token only) matches one or more trailing tokens.

use std::collections::BTreeMap;

/// Top-level routing categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubjectCategory {
    Events,
    Tasks,
    Responses,
    Broadcasts,
    Heartbeats,
    Errors,
}

impl SubjectCategory {
    pub const ALL: [SubjectCategory; 6] = [
        SubjectCategory::Events,
        SubjectCategory::Tasks,
        SubjectCategory::Responses,
        SubjectCategory::Broadcasts,
        SubjectCategory::Heartbeats,
        SubjectCategory::Errors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectCategory::Events => "events",
            SubjectCategory::Tasks => "tasks",
            SubjectCategory::Responses => "responses",
            SubjectCategory::Broadcasts => "broadcasts",
            SubjectCategory::Heartbeats => "heartbeats",
            SubjectCategory::Errors => "errors",
        }
    }
}

/// Builds concrete subjects and patterns under one prefix.
#[derive(Debug, Clone)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}.{category}.>`: every subject in the category.
    pub fn pattern(&self, category: SubjectCategory) -> String {
        format!("{}.{}.>", self.prefix, category.as_str())
    }

    /// Category name to pattern, for statistics.
    pub fn patterns(&self) -> BTreeMap<String, String> {
        SubjectCategory::ALL
            .into_iter()
            .map(|c| (c.as_str().to_string(), self.pattern(c)))
            .collect()
    }

    fn concrete(&self, category: SubjectCategory, key: &str) -> String {
        format!("{}.{}.{}", self.prefix, category.as_str(), key)
    }

    pub fn event(&self, event_type: &str) -> String {
        self.concrete(SubjectCategory::Events, event_type)
    }

    /// `{prefix}.tasks.{task_type}`, or `{prefix}.tasks.{agent_type}.{task_type}`
    /// when the task targets one agent type.
    pub fn task(&self, task_type: &str, agent_type: Option<&str>) -> String {
        match agent_type {
            Some(agent_type) => {
                self.concrete(SubjectCategory::Tasks, &format!("{agent_type}.{task_type}"))
            }
            None => self.concrete(SubjectCategory::Tasks, task_type),
        }
    }

    /// Where results for `task_id` are published.
    pub fn response(&self, task_id: &str) -> String {
        self.concrete(SubjectCategory::Responses, task_id)
    }

    pub fn broadcast(&self, message_type: &str) -> String {
        self.concrete(SubjectCategory::Broadcasts, message_type)
    }

    pub fn heartbeat(&self, sender_id: &str) -> String {
        self.concrete(SubjectCategory::Heartbeats, sender_id)
    }

    pub fn error(&self, key: &str) -> String {
        self.concrete(SubjectCategory::Errors, key)
    }

    /// Error subject for a failed delivery on `subject`: the prefix is
    /// stripped and the remainder becomes the key.
    pub fn error_for(&self, subject: &str) -> String {
        let key = subject
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(subject);
        self.error(key)
    }

    /// Dedicated channel of one agent; subscribe to `{channel}.*`.
    pub fn agent_channel(&self, agent_id: &str) -> String {
        format!("{}.agents.{}", self.prefix, agent_id)
    }
}

/// Reply subject for a request: `{subject}.response.{correlation_id}`.
pub fn reply_subject(subject: &str, correlation_id: &str) -> String {
    format!("{subject}.response.{correlation_id}")
}

/// Whether `subject` is a well-formed subject or pattern (no empty tokens,
/// no whitespace, `>` only as the last token).
pub fn is_valid(subject: &str) -> bool {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    tokens.iter().enumerate().all(|(i, token)| {
        !token.is_empty() && (*token != ">" || i == tokens.len() - 1)
    })
}

/// A subject messages can be published to: valid and wildcard-free.
pub fn is_concrete(subject: &str) -> bool {
    is_valid(subject) && subject.split('.').all(|t| t != "*" && t != ">")
}

/// Whether `subject` is matched by `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Whether every subject matched by `inner` is also matched by `outer`.
pub fn pattern_covers(outer: &str, inner: &str) -> bool {
    let mut outer_tokens = outer.split('.');
    let mut inner_tokens = inner.split('.');
    loop {
        match (outer_tokens.next(), inner_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(i)) if i != ">" => {}
            (Some(o), Some(i)) if o == i => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concrete_subjects() {
        let subjects = Subjects::new("switchyard");
        assert_eq!(subjects.event("build.done"), "switchyard.events.build.done");
        assert_eq!(subjects.task("lint", None), "switchyard.tasks.lint");
        assert_eq!(
            subjects.task("lint", Some("code_analysis")),
            "switchyard.tasks.code_analysis.lint"
        );
        assert_eq!(subjects.response("t-1"), "switchyard.responses.t-1");
        assert_eq!(subjects.heartbeat("a-1"), "switchyard.heartbeats.a-1");
        assert_eq!(subjects.agent_channel("a-1"), "switchyard.agents.a-1");
        assert_eq!(subjects.pattern(SubjectCategory::Tasks), "switchyard.tasks.>");
        assert_eq!(subjects.patterns().len(), 6);
    }

    #[test]
    fn test_error_subject_strips_prefix() {
        let subjects = Subjects::new("switchyard");
        assert_eq!(
            subjects.error_for("switchyard.tasks.lint"),
            "switchyard.errors.tasks.lint"
        );
        assert_eq!(subjects.error_for("other.thing"), "switchyard.errors.other.thing");
    }

    #[test]
    fn test_wildcards() {
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(!subject_matches("a.*.c", "a.b.x.c"));
        assert!(subject_matches("a.>", "a.b"));
        assert!(subject_matches("a.>", "a.b.c.d"));
        assert!(!subject_matches("a.>", "a"));
        assert!(subject_matches("a.b", "a.b"));
        assert!(!subject_matches("a.b", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
    }

    #[test]
    fn test_pattern_covers() {
        assert!(pattern_covers("app.tasks.>", "app.tasks.>"));
        assert!(pattern_covers("app.tasks.>", "app.tasks.code_analysis.>"));
        assert!(pattern_covers("app.tasks.>", "app.tasks.lint"));
        assert!(pattern_covers("app.*.x", "app.*.x"));
        assert!(!pattern_covers("app.*.x", "app.>"));
        assert!(!pattern_covers("app.tasks.>", "app.>"));
        assert!(!pattern_covers("app.tasks.>", "app.tasks"));
        assert!(!pattern_covers("app.tasks.lint", "app.tasks.*"));
    }

    #[test]
    fn test_validity() {
        assert!(is_valid("a.*.>"));
        assert!(!is_valid("a.>.b"));
        assert!(!is_valid("a..b"));
        assert!(!is_valid("a b"));
        assert!(!is_valid(""));
        assert!(is_concrete("a.b.c"));
        assert!(!is_concrete("a.*"));
        assert!(!is_concrete("a.>"));
    }

    #[test]
    fn test_reply_subject() {
        assert_eq!(
            reply_subject("switchyard.rpc.ping", "c1"),
            "switchyard.rpc.ping.response.c1"
        );
    }
}
