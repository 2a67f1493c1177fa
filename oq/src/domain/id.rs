//! Operation ID generation and prefix resolution
//!
//! All IDs use the format: `{8-char-hex}-{type}-{slug}`
//! Example: `9f3a01c2-copy-backup-photos`

/// Generate an operation ID from its type and description
///
/// The hex prefix comes from the random tail of a UUIDv7 so that two
/// operations submitted in the same millisecond still get distinct IDs.
pub fn generate_id(operation_type: &str, description: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    let hex = &uuid[uuid.len() - 8..];
    let slug = slugify(description);
    if slug.is_empty() {
        format!("{}-{}", hex, operation_type)
    } else {
        format!("{}-{}-{}", hex, operation_type, slug)
    }
}

/// Slugify a description for use in IDs
fn slugify(description: &str) -> String {
    let slug = description
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    // Keep IDs readable in a terminal
    match slug.char_indices().nth(32) {
        Some((idx, _)) => slug[..idx].trim_end_matches('-').to_string(),
        None => slug,
    }
}

/// Resolve a user-typed ID or ID prefix against known IDs
///
/// An exact match wins outright; otherwise every ID starting with `query` is returned.
pub fn matching_ids<'a>(query: &str, ids: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut matches = Vec::new();
    for id in ids {
        if id == query {
            return vec![id];
        }
        if id.starts_with(query) {
            matches.push(id);
        }
    }
    matches
}
