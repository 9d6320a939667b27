//! Derived resource names
//!
//! Every name clonedr derives embeds the action identifier as a suffix, so
//! truncation only ever shortens the base.

/// Maximum length of most Kubernetes object names used as DNS labels
pub const MAX_NAME_LENGTH: usize = 63;

/// Maximum length of a CloudNativePG cluster name (pods and services append suffixes)
pub const MAX_CLUSTER_NAME_LENGTH: usize = 50;

/// Lowercase, replace characters outside `[a-z0-9-]` with `-`, and collapse dashes
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    out.trim_end_matches('-').to_string()
}

/// Join `base` and `suffix` with a dash, truncating only `base` to fit `max_len`
pub fn limited_name(base: &str, suffix: &str, max_len: usize) -> String {
    let base = sanitize(base);
    let suffix = sanitize(suffix);
    if suffix.is_empty() {
        return truncate(&base, max_len);
    }
    if base.is_empty() {
        return truncate(&suffix, max_len);
    }

    let room = max_len.saturating_sub(suffix.len() + 1);
    if room == 0 {
        return truncate(&suffix, max_len);
    }
    let base = truncate(&base, room);
    format!("{}-{}", base, suffix)
}

fn truncate(name: &str, max_len: usize) -> String {
    let cut: String = name.chars().take(max_len).collect();
    cut.trim_end_matches('-').to_string()
}
