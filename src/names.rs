use serde::Serialize;

/// How strongly two person names agree. Ordered strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchTier {
    Exact,
    Contains,
    Token,
}

fn compact(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn tokens(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split_whitespace()
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Loose person-name comparison for hand-typed roster names.
///
/// Exact after lowercasing and dropping whitespace; otherwise containment in
/// either direction when the shorter side has more than 3 characters;
/// otherwise any pair of >2-char tokens where one contains the other.
pub fn match_names(a: &str, b: &str) -> Option<MatchTier> {
    let ca = compact(a);
    let cb = compact(b);
    if ca.is_empty() || cb.is_empty() {
        return None;
    }
    if ca == cb {
        return Some(MatchTier::Exact);
    }
    let (short, long) = if ca.chars().count() <= cb.chars().count() {
        (&ca, &cb)
    } else {
        (&cb, &ca)
    };
    if short.chars().count() > 3 && long.contains(short.as_str()) {
        return Some(MatchTier::Contains);
    }
    let ta = tokens(a);
    let tb = tokens(b);
    let overlap = ta
        .iter()
        .any(|x| tb.iter().any(|y| x.contains(y.as_str()) || y.contains(x.as_str())));
    overlap.then_some(MatchTier::Token)
}

/// Spellings tried when looking a name up by equality: as typed, Title, UPPER, lower.
pub fn case_variants(name: &str) -> Vec<String> {
    let t = name.trim();
    let mut title = String::with_capacity(t.len());
    let mut chars = t.chars();
    if let Some(first) = chars.next() {
        title.extend(first.to_uppercase());
        title.push_str(chars.as_str());
    }
    let mut out = vec![t.to_string()];
    for v in [title, t.to_uppercase(), t.to_lowercase()] {
        if !v.is_empty() && !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Last-resort lookup: the account name equals one of the roster name's
/// tokens ("v" in "v v", "ravi" in "ravi k.").
pub fn name_is_token_of(account_name: &str, roster_name: &str) -> bool {
    let needle = account_name.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    roster_name
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '.')
        .filter(|t| !t.is_empty())
        .any(|t| t == needle)
}
