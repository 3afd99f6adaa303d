//! Contextualized embedding text generation.
//!
//! Embedding raw code alone gives poor retrieval quality. Prepending the file
//! path, unit kind and name, and language tag improves results for conceptual
//! queries like "where is auth handled?"

use crate::unit::SemanticUnit;

/// Upper bound on the content bytes sent to the embedding model per unit.
const MAX_EMBED_CONTENT_BYTES: usize = 16 * 1024;

/// Generate text optimized for embedding (not for display).
///
/// The result is also the cache key input, so it must depend only on the unit.
#[must_use]
pub fn contextualize_for_embedding(unit: &SemanticUnit) -> String {
    let content = truncate_at_char_boundary(&unit.content, MAX_EMBED_CONTENT_BYTES);
    let mut text = String::with_capacity(content.len() + 128);

    text.push_str("# ");
    text.push_str(&unit.file_path);
    text.push('\n');

    text.push_str("# ");
    text.push_str(unit.unit_type.as_str());
    text.push_str(": ");
    text.push_str(&unit.name);
    text.push('\n');

    text.push_str("# Language: ");
    text.push_str(unit.language.id());
    text.push('\n');

    text.push_str(content);
    text
}

/// Generate a short header for display in search results.
#[must_use]
pub fn unit_display_header(file_path: &str, name: &str, start_line: usize, end_line: usize) -> String {
    format!("{file_path} :: {name} (lines {start_line}-{end_line})")
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
