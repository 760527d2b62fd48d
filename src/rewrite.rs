use crate::schedule::{covered_period_ids, Period, Schedule};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// How a subject is located inside free-text cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryPolicy {
    /// Subject must stand as its own word: "Art" never matches inside "Smart".
    #[default]
    Word,
    /// Case-insensitive substring match, kept for parity with older data.
    Substring,
}

impl BoundaryPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "word" => Some(Self::Word),
            "substring" => Some(Self::Substring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RewriteMode {
    Replace,
    Inject,
    Remove,
}

/// A teacher binding change for one subject.
#[derive(Debug, Clone, Copy)]
pub struct TeacherChange<'a> {
    pub subject: &'a str,
    pub old: Option<&'a str>,
    pub new: Option<&'a str>,
}

impl<'a> TeacherChange<'a> {
    pub fn new(subject: &'a str, old: Option<&'a str>, new: Option<&'a str>) -> Self {
        let clean = |v: Option<&'a str>| v.map(str::trim).filter(|s| !s.is_empty());
        Self {
            subject: subject.trim(),
            old: clean(old),
            new: clean(new),
        }
    }

    pub fn mode(&self) -> RewriteMode {
        match (self.old, self.new) {
            (Some(_), Some(_)) => RewriteMode::Replace,
            (None, Some(_)) => RewriteMode::Inject,
            (_, None) => RewriteMode::Remove,
        }
    }
}

fn trailing_annotation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\(([^()]*)\)").expect("static annotation regex"))
}

fn subject_re(subject: &str) -> Option<Regex> {
    Regex::new(&format!("(?i){}", regex::escape(subject))).ok()
}

/// Rewrites the teacher annotation after every occurrence of the subject.
/// Returns `None` when the text is left unchanged.
pub fn rewrite_text(text: &str, change: &TeacherChange<'_>, policy: BoundaryPolicy) -> Option<String> {
    if change.subject.is_empty() {
        return None;
    }
    let out = match policy {
        BoundaryPolicy::Substring => rewrite_substring(text, change)?,
        BoundaryPolicy::Word => rewrite_word(text, change)?,
    };
    (out != text).then_some(out)
}

fn rewrite_substring(text: &str, change: &TeacherChange<'_>) -> Option<String> {
    let escaped = regex::escape(change.subject);
    let token = Regex::new(&format!(r"(?i)({})(\s*\(.*?\))?", escaped)).ok()?;
    if !token.is_match(text) {
        return None;
    }
    let out = token.replace_all(text, |caps: &Captures<'_>| match change.new {
        Some(name) => format!("{} ({})", &caps[1], name),
        None => caps[1].to_string(),
    });
    Some(out.into_owned())
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn paren_depth(prefix: &str) -> i32 {
    prefix.chars().fold(0, |d, c| match c {
        '(' => d + 1,
        ')' => (d - 1).max(0),
        _ => d,
    })
}

fn rewrite_word(text: &str, change: &TeacherChange<'_>) -> Option<String> {
    let re = subject_re(change.subject)?;
    let mut out = String::with_capacity(text.len() + 16);
    let mut cursor = 0;
    let mut touched = false;

    for m in re.find_iter(text) {
        if m.start() < cursor {
            continue;
        }
        let before = text[..m.start()].chars().next_back();
        let after = text[m.end()..].chars().next();
        if before.is_some_and(is_word_char) || after.is_some_and(is_word_char) {
            continue;
        }
        if paren_depth(&text[..m.start()]) > 0 {
            continue;
        }

        let rest = &text[m.end()..];
        let annotation = trailing_annotation_re().captures(rest);
        let existing = annotation
            .as_ref()
            .and_then(|c| c.get(1))
            .map(|g| g.as_str().trim());
        let annotation_len = annotation
            .as_ref()
            .and_then(|c| c.get(0))
            .map(|g| g.end())
            .unwrap_or(0);
        let names_old = |name: &str| {
            change
                .old
                .map(|old| old.eq_ignore_ascii_case(name))
                .unwrap_or(true)
        };

        let replacement = match (change.mode(), existing) {
            (RewriteMode::Replace, Some(name)) if names_old(name) => change.new.map(|n| format!(" ({})", n)),
            (RewriteMode::Replace, None) => change.new.map(|n| format!(" ({})", n)),
            (RewriteMode::Inject, None) => change.new.map(|n| format!(" ({})", n)),
            (RewriteMode::Remove, Some(name)) if names_old(name) => Some(String::new()),
            _ => None,
        };

        let Some(replacement) = replacement else {
            continue;
        };
        out.push_str(&text[cursor..m.end()]);
        out.push_str(&replacement);
        cursor = m.end() + annotation_len;
        touched = true;
    }

    if !touched {
        return None;
    }
    out.push_str(&text[cursor..]);
    Some(out)
}

/// Applies the change to every visible cell; cells hidden under a span are
/// left alone. Returns the number of cells changed.
pub fn rewrite_schedule(
    schedule: &mut Schedule,
    periods: &[Period],
    change: &TeacherChange<'_>,
    policy: BoundaryPolicy,
) -> usize {
    let mut changed = 0;
    for row in schedule.values_mut() {
        let covered = covered_period_ids(periods, row);
        for (period_id, cell) in row.iter_mut() {
            if covered.contains(period_id) {
                continue;
            }
            if let Some(next) = rewrite_text(&cell.subject, change, policy) {
                cell.subject = next;
                changed += 1;
            }
        }
    }
    changed
}
