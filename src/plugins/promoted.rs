use memchr::memmem;
use serde::Deserialize;
use serde_json::Value;

use super::placeholder::{ContentKind, placeholder_for, placeholder_json_value};
use super::{ContentFilter, FilterResult, PlaceholderMode, PluginSettings, RequestInfo, RuleHit};
use crate::error::ProxyError;
use crate::http1::{ResponseHead, content_type_essence, header_value};

/// Site-specific promoted-content stripper: removes ad elements from HTML
/// fragments by tag markers and filters ad entries out of JSON documents by
/// operation. Parse failures fail open.
pub struct PromotedContentFilter {
    placeholder: PlaceholderMode,
    options: Options,
}

#[derive(Debug, Clone, Deserialize)]
struct MarkerRule {
    rule: String,
    open: String,
    close: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OperationRule {
    operation: String,
    /// Path from the document root to the entry array.
    path: Vec<String>,
    #[serde(default = "default_ad_typenames")]
    ad_typenames: Vec<String>,
    /// Recompute the sibling `pageInfo.endCursor` when the last entry was an
    /// ad. The cursor wire format is not assumed stable: the field is only
    /// rewritten when the last remaining entry carries a plain string
    /// `cursor` or `id`.
    #[serde(default = "default_true")]
    fix_cursor: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct Options {
    /// URL paths eligible for HTML processing; `/` matches the homepage
    /// exactly, any other entry is a prefix.
    #[serde(default = "default_paths")]
    paths: Vec<String>,
    #[serde(default = "default_markers")]
    markers: Vec<MarkerRule>,
    #[serde(default = "default_operations")]
    operations: Vec<OperationRule>,
    #[serde(default = "default_operation_header")]
    operation_header: String,
}

fn default_true() -> bool {
    true
}

fn default_paths() -> Vec<String> {
    vec!["/".into(), "/api/v1/cards".into(), "/news/".into()]
}

fn default_markers() -> Vec<MarkerRule> {
    vec![
        MarkerRule {
            rule: "promoted-card".into(),
            open: "<promoted-card".into(),
            close: "</promoted-card>".into(),
        },
        MarkerRule {
            rule: "ad-banner".into(),
            open: "<ad-banner".into(),
            close: "</ad-banner>".into(),
        },
    ]
}

fn default_operations() -> Vec<OperationRule> {
    vec![OperationRule {
        operation: "CardsFeed".into(),
        path: vec!["data".into(), "cards".into(), "edges".into()],
        ad_typenames: default_ad_typenames(),
        fix_cursor: true,
    }]
}

fn default_ad_typenames() -> Vec<String> {
    vec!["AdCard".into(), "SponsoredPost".into()]
}

fn default_operation_header() -> String {
    "x-operation-name".into()
}

impl Default for Options {
    fn default() -> Self {
        Self {
            paths: default_paths(),
            markers: default_markers(),
            operations: default_operations(),
            operation_header: default_operation_header(),
        }
    }
}

/// Structural ad predicate: a non-null `adPayload`, a known ad `__typename`,
/// or either of those on a GraphQL-style `node`.
fn is_ad_entry(entry: &Value, ad_typenames: &[String]) -> bool {
    let Some(obj) = entry.as_object() else {
        return false;
    };
    if obj.get("adPayload").is_some_and(|v| !v.is_null()) {
        return true;
    }
    if obj
        .get("__typename")
        .and_then(|v| v.as_str())
        .is_some_and(|t| ad_typenames.iter().any(|a| a == t))
    {
        return true;
    }
    if let Some(node) = obj.get("node") {
        if !node.is_null() {
            return is_ad_entry(node, ad_typenames);
        }
    }
    false
}

fn entry_cursor(entry: &Value) -> Option<String> {
    let obj = entry.as_object()?;
    for key in ["cursor", "id"] {
        if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

impl PromotedContentFilter {
    pub fn new() -> Self {
        Self {
            placeholder: PlaceholderMode::Visible,
            options: Options::default(),
        }
    }

    fn path_allowed(&self, path: &str) -> bool {
        let bare = path.split('?').next().unwrap_or(path);
        self.options.paths.iter().any(|entry| {
            if entry == "/" {
                bare == "/"
            } else {
                bare.starts_with(entry.as_str())
            }
        })
    }

    /// Replaces every `open ... close` span of one marker rule with the
    /// placeholder. An opening marker without its closing tag aborts the rule
    /// and leaves the remainder untouched.
    fn strip_html_rule(&self, body: &mut Vec<u8>, rule: &MarkerRule) -> (bool, u64) {
        let placeholder =
            placeholder_for(self.placeholder, self.name(), &rule.rule, ContentKind::Html);
        let mut matched = false;
        let mut removed = 0u64;
        let mut pos = 0usize;
        loop {
            let Some(rel) = memmem::find(&body[pos..], rule.open.as_bytes()) else {
                break;
            };
            matched = true;
            let start = pos + rel;
            let Some(close_rel) = memmem::find(&body[start..], rule.close.as_bytes()) else {
                break;
            };
            let end = start + close_rel + rule.close.len();
            body.splice(start..end, placeholder.bytes());
            removed += 1;
            pos = start + placeholder.len();
        }
        (matched, removed)
    }

    /// Walks to the operation's entry array, drops or substitutes ad entries
    /// and recomputes the pagination cursor when it pointed at a removed
    /// entry.
    fn filter_json_operation(&self, doc: &mut Value, op: &OperationRule) -> u64 {
        let mut parent = &mut *doc;
        let Some((last, walk)) = op.path.split_last() else {
            return 0;
        };
        for key in walk {
            let Some(next) = parent.get_mut(key) else {
                return 0;
            };
            parent = next;
        }
        let Some(entries) = parent.get(last).and_then(|v| v.as_array()) else {
            return 0;
        };

        let original_last_was_ad = entries
            .last()
            .is_some_and(|e| is_ad_entry(e, &op.ad_typenames));
        let mut removed = 0u64;
        let mut filtered = Vec::with_capacity(entries.len());
        for entry in entries {
            if is_ad_entry(entry, &op.ad_typenames) {
                removed += 1;
                if let Some(marker) =
                    placeholder_json_value(self.placeholder, self.name(), &op.operation)
                {
                    filtered.push(marker);
                }
            } else {
                filtered.push(entry.clone());
            }
        }
        if removed == 0 {
            return 0;
        }

        let new_cursor = filtered
            .iter()
            .rev()
            .find(|e| !is_placeholder(e))
            .and_then(entry_cursor);
        if let Some(slot) = parent.get_mut(last) {
            *slot = Value::Array(filtered);
        }
        if op.fix_cursor && original_last_was_ad {
            if let (Some(cursor), Some(page_info)) = (
                new_cursor,
                parent.get_mut("pageInfo").and_then(|v| v.as_object_mut()),
            ) {
                if page_info.contains_key("endCursor") {
                    page_info.insert("endCursor".into(), Value::String(cursor));
                }
            }
        }
        removed
    }
}

fn is_placeholder(entry: &Value) -> bool {
    entry
        .as_object()
        .is_some_and(|o| o.contains_key("adscrub_removed") || o.contains_key("_adscrub"))
}

impl Default for PromotedContentFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentFilter for PromotedContentFilter {
    fn name(&self) -> &'static str {
        "promoted"
    }

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    fn default_domains(&self) -> &'static [&'static str] {
        &["www.newssite.example"]
    }

    fn init(&mut self, settings: &PluginSettings) -> Result<(), ProxyError> {
        self.placeholder = settings.placeholder;
        if !settings.options.is_empty() {
            self.options =
                serde_json::from_value(Value::Object(settings.options.clone())).map_err(|e| {
                    ProxyError::plugin("promoted", format!("invalid options: {e}"))
                })?;
        }
        Ok(())
    }

    fn filter(
        &self,
        req: &RequestInfo<'_>,
        resp: &ResponseHead,
        body: &[u8],
    ) -> Result<(Option<Vec<u8>>, FilterResult), ProxyError> {
        let essence = content_type_essence(&resp.headers).unwrap_or_default();

        if essence == "text/html" || essence.ends_with("+html") {
            if !self.path_allowed(req.path) {
                return Ok((None, FilterResult::unmatched()));
            }
            // Quick byte-scan: no marker substring, no work.
            if !self
                .options
                .markers
                .iter()
                .any(|m| memmem::find(body, m.open.as_bytes()).is_some())
            {
                return Ok((None, FilterResult::unmatched()));
            }
            let mut out = body.to_vec();
            let mut matched = false;
            let mut hits = Vec::<RuleHit>::new();
            let mut total = 0u64;
            for rule in &self.options.markers {
                let (rule_matched, removed) = self.strip_html_rule(&mut out, rule);
                matched |= rule_matched;
                if removed > 0 {
                    total += removed;
                    hits.push(RuleHit {
                        rule: rule.rule.clone(),
                        count: removed,
                        modified: true,
                    });
                }
            }
            let result = FilterResult {
                matched,
                modified: total > 0,
                rule: hits.first().map(|h| h.rule.clone()).unwrap_or_default(),
                removed: total,
                rules: hits,
            };
            let output = if total > 0 { Some(out) } else { None };
            return Ok((output, result));
        }

        if essence == "application/json" {
            let Some(op_name) = header_value(req.headers, &self.options.operation_header) else {
                return Ok((None, FilterResult::unmatched()));
            };
            let Some(op) = self
                .options
                .operations
                .iter()
                .find(|o| o.operation.eq_ignore_ascii_case(op_name))
            else {
                return Ok((None, FilterResult::unmatched()));
            };
            // Fail open on any parse problem.
            let Ok(mut doc) = serde_json::from_slice::<Value>(body) else {
                return Ok((None, FilterResult::unmatched()));
            };
            let removed = self.filter_json_operation(&mut doc, op);
            if removed == 0 {
                return Ok((
                    None,
                    FilterResult {
                        matched: true,
                        ..FilterResult::unmatched()
                    },
                ));
            }
            let Ok(serialized) = serde_json::to_vec(&doc) else {
                return Ok((None, FilterResult::unmatched()));
            };
            let result = FilterResult {
                matched: true,
                modified: true,
                rule: op.operation.clone(),
                removed,
                rules: vec![RuleHit {
                    rule: op.operation.clone(),
                    count: removed,
                    modified: true,
                }],
            };
            return Ok((Some(serialized), result));
        }

        Ok((None, FilterResult::unmatched()))
    }
}
