//! Selector matching helpers shared by the registry and the status-file scan

/// Strip surrounding whitespace and trailing path separators
pub fn normalize_selector(selector: &str) -> &str {
    selector.trim().trim_end_matches(['/', '\\'])
}

/// True when `instance_id` ends with `/query` or `\query`
///
/// Matching only on a separator boundary keeps `Game` from selecting
/// `/work/MyGame`.
pub fn matches_path_suffix(instance_id: &str, query: &str) -> bool {
    if query.is_empty() {
        return false;
    }
    match instance_id.strip_suffix(query) {
        Some(rest) => rest.ends_with('/') || rest.ends_with('\\'),
        None => false,
    }
}
