use regex::Regex;

use crate::domain::DatasetMetadata;

/// Strip markup from a user-authored string. Bundles are shared between
/// users, so free-text fields are cleaned before they are stored or rendered:
/// script/style elements go including their content, every other tag is
/// dropped, and the usual entities are decoded.
pub fn strip_markup(value: &str) -> String {
    let script_re = Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").unwrap();
    let tag_re = Regex::new(r"(?s)</?[a-zA-Z][^>]*>").unwrap();

    let without_scripts = script_re.replace_all(value, "");
    let without_tags = tag_re.replace_all(&without_scripts, "");
    let decoded = without_tags
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.trim().to_string()
}

/// Clean every free-text field of a metadata block in place. Identity fields
/// (`identifier`, `version`, `type`) are machine values validated elsewhere
/// and are left untouched.
pub fn sanitize_metadata(metadata: &mut DatasetMetadata) {
    metadata.display_name = strip_markup(&metadata.display_name);
    if let Some(author) = metadata.author.take() {
        metadata.author = Some(strip_markup(&author));
    }
    if let Some(description) = metadata.description.take() {
        metadata.description = Some(strip_markup(&description));
    }
}
