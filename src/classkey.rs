use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Pre-primary classes come before every numbered grade.
const PRE_PRIMARY: &[&str] = &["nursery", "lkg", "ukg"];

fn ordinal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)(st|nd|rd|th)").expect("static ordinal regex"))
}

fn class_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^class\s+").expect("static class prefix regex"))
}

/// "10th" -> "10", "1st" -> "1". Only the first ordinal is rewritten; other text is kept.
pub fn normalize_class(raw: &str) -> String {
    ordinal_re().replace(raw.trim(), "$1").to_string()
}

pub fn normalize_section(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Equality used when matching a stored class string against a requested one.
/// "10", "10th", "Class 10" and "class 10TH" all compare equal.
pub fn same_class(a: &str, b: &str) -> bool {
    comparable(a) == comparable(b)
}

fn comparable(raw: &str) -> String {
    let n = normalize_class(raw);
    let n = class_prefix_re().replace(&n, "");
    let n = n.trim();
    let digits_only = !n.is_empty() && n.chars().all(|c| c.is_ascii_digit());
    if digits_only {
        let stripped = n.trim_start_matches('0');
        return if stripped.is_empty() { "0".to_string() } else { stripped.to_string() };
    }
    n.to_lowercase()
}

/// Every spelling a historical record might have used for the same class.
/// Order is stable: raw, ordinal-normalised, zero-stripped, "Class N".
pub fn class_variants(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |s: String| {
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    };
    let trimmed = raw.trim().to_string();
    push(trimmed.clone());
    let normalized = normalize_class(&trimmed);
    push(normalized.clone());
    let base = class_prefix_re().replace(&normalized, "").trim().to_string();
    if !base.is_empty() && base.chars().all(|c| c.is_ascii_digit()) {
        let stripped = base.trim_start_matches('0');
        let stripped = if stripped.is_empty() { "0" } else { stripped };
        push(stripped.to_string());
        push(format!("Class {}", stripped));
    } else {
        push(base);
    }
    out
}

fn class_rank(class_name: &str) -> Option<(u8, u64)> {
    let key = comparable(class_name);
    if let Some(i) = PRE_PRIMARY.iter().position(|p| *p == key) {
        return Some((0, i as u64));
    }
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_digit()) {
        return key.parse().ok().map(|n| (1, n));
    }
    None
}

/// Nursery, LKG, UKG, then grades by number under any spelling
/// ("08", "8th", "Class 8"), then unknown classes alphabetically.
pub fn compare_classes(a: &str, b: &str) -> Ordering {
    match (class_rank(a), class_rank(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
