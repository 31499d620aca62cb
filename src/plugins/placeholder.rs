use super::PlaceholderMode;

/// Content families that carry placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Json,
}

/// Deterministic placeholder text for a removed span. HTML gets an inline
/// element or comment; JSON gets an object literal with a marker key.
pub fn placeholder_for(
    mode: PlaceholderMode,
    plugin: &str,
    rule: &str,
    kind: ContentKind,
) -> String {
    match (mode, kind) {
        (PlaceholderMode::None, _) => String::new(),
        (PlaceholderMode::Visible, ContentKind::Html) => format!(
            "<span style=\"font-size:.75em;opacity:.6\" data-adscrub=\"{plugin}/{rule}\">[removed]</span>"
        ),
        (PlaceholderMode::Comment, ContentKind::Html) => {
            format!("<!-- adscrub {plugin}/{rule} -->")
        }
        (PlaceholderMode::Visible, ContentKind::Json) => {
            format!("{{\"adscrub_removed\":\"{plugin}/{rule}\"}}")
        }
        (PlaceholderMode::Comment, ContentKind::Json) => {
            format!("{{\"_adscrub\":\"{plugin}/{rule}\"}}")
        }
    }
}

/// JSON placeholder as a document node, for filters that edit parsed
/// documents instead of byte spans. `None` means drop the entry entirely.
pub fn placeholder_json_value(
    mode: PlaceholderMode,
    plugin: &str,
    rule: &str,
) -> Option<serde_json::Value> {
    let key = match mode {
        PlaceholderMode::None => return None,
        PlaceholderMode::Visible => "adscrub_removed",
        PlaceholderMode::Comment => "_adscrub",
    };
    let mut obj = serde_json::Map::new();
    obj.insert(
        key.to_string(),
        serde_json::Value::String(format!("{plugin}/{rule}")),
    );
    Some(serde_json::Value::Object(obj))
}
