//! Semver-ish comparison of version strings reported by package managers.

use crate::types::UpdateType;

/// Parse a `(major, minor, patch)` triple. Leading range operators and a `v`
/// prefix are stripped; missing minor/patch components count as zero; any
/// pre-release or build suffix on the last component is ignored.
pub fn parse_triple(raw: &str) -> Option<(u64, u64, u64)> {
    let s = strip_prefix(raw);
    let mut parts = s.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = match parts.next() {
        Some(p) => leading_number(p)?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(p) => leading_number(p)?,
        None => 0,
    };
    Some((major, minor, patch))
}

/// Classify the move from `current` to `latest`.
pub fn classify(current: &str, latest: &str) -> UpdateType {
    let (Some(cur), Some(new)) = (parse_triple(current), parse_triple(latest)) else {
        return UpdateType::Unknown;
    };
    if new.0 > cur.0 {
        UpdateType::Major
    } else if new.0 == cur.0 && new.1 > cur.1 {
        UpdateType::Minor
    } else if new.0 == cur.0 && new.1 == cur.1 && new.2 > cur.2 {
        UpdateType::Patch
    } else {
        UpdateType::Unknown
    }
}

/// The range operator in front of a manifest version, e.g. `^` in `^1.2.3`.
pub fn range_prefix(spec: &str) -> &str {
    let trimmed = spec.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    let prefix = &trimmed[..end];
    // Only well-known operators survive a rewrite; tags like `latest` don't.
    match prefix.trim() {
        "^" | "~" | ">=" | "=" | "~>" | "==" | "~=" | "" => prefix.trim(),
        _ => "",
    }
}

fn strip_prefix(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches(|c: char| matches!(c, '^' | '~' | '=' | '>' | '<' | ' '))
        .trim_start_matches('v')
}

fn leading_number(part: &str) -> Option<u64> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
