use std::sync::{Arc, RwLock};

use regex::bytes::{NoExpand, Regex};

use super::html_guard;
use super::{ContentFilter, FilterResult, PluginSettings, RequestInfo, RuleHit};
use crate::error::ProxyError;
use crate::http1::{ResponseHead, content_type_essence};
use crate::rewrite_store::{RewriteRule, RewriteRuleStore};

const DEFAULT_RULES_PATH: &str = "rewrite_rules.json";

struct CompiledRule {
    name: String,
    regex: Regex,
    replacement: Vec<u8>,
    is_regex: bool,
    domains: Vec<String>,
    url_globs: Vec<regex::Regex>,
    content_types: Vec<String>,
    enabled: bool,
}

#[derive(Default)]
struct CompiledRuleSet {
    rules: Vec<CompiledRule>,
}

/// Standard glob where `*` matches any non-slash sequence.
fn glob_to_regex(glob: &str) -> Result<regex::Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        if c == '*' {
            pattern.push_str("[^/]*");
        } else {
            pattern.push_str(&regex::escape(&c.to_string()));
        }
    }
    pattern.push('$');
    regex::Regex::new(&pattern)
}

fn compile(rules: &[RewriteRule]) -> CompiledRuleSet {
    let mut compiled = Vec::with_capacity(rules.len());
    for rule in rules {
        let source = if rule.is_regex {
            rule.pattern.clone()
        } else {
            regex::escape(&rule.pattern)
        };
        let regex = match Regex::new(&source) {
            Ok(r) => r,
            Err(e) => {
                // Store validation keeps this from happening through the API;
                // a hand-edited file falls through without taking the set down.
                tracing::warn!(rule = %rule.name, error = %e, "skipping uncompilable rewrite rule");
                continue;
            }
        };
        let mut url_globs = Vec::new();
        let mut globs_ok = true;
        for glob in &rule.url_patterns {
            match glob_to_regex(glob) {
                Ok(r) => url_globs.push(r),
                Err(e) => {
                    tracing::warn!(rule = %rule.name, glob, error = %e, "skipping rule with bad url glob");
                    globs_ok = false;
                    break;
                }
            }
        }
        if !globs_ok {
            continue;
        }
        compiled.push(CompiledRule {
            name: rule.name.clone(),
            regex,
            replacement: rule.replacement.clone().into_bytes(),
            is_regex: rule.is_regex,
            domains: rule.domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
            content_types: rule
                .content_types
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
            url_globs,
            enabled: rule.enabled,
        });
    }
    CompiledRuleSet { rules: compiled }
}

fn default_scope_allows(essence: &str) -> bool {
    if essence == "text/html" || essence.ends_with("+html") || essence == "text/plain" {
        return true;
    }
    if matches!(
        essence,
        "application/json" | "application/javascript" | "application/xml"
    ) {
        return false;
    }
    essence.starts_with("text/")
}

fn is_html(essence: &str) -> bool {
    essence == "text/html" || essence.ends_with("+html")
}

impl CompiledRule {
    /// Short-circuit scoping checks, in order: enabled, domain, URL glob,
    /// content type.
    fn in_scope(&self, host: &str, path: &str, essence: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.domains.is_empty() {
            let host = host.to_ascii_lowercase();
            if !self.domains.iter().any(|d| d == &host) {
                return false;
            }
        }
        if !self.url_globs.is_empty() {
            let bare = path.split('?').next().unwrap_or(path);
            if !self.url_globs.iter().any(|g| g.is_match(bare)) {
                return false;
            }
        }
        if !self.content_types.is_empty() {
            self.content_types.iter().any(|c| c == essence)
        } else {
            default_scope_allows(essence)
        }
    }

    fn apply(&self, input: &[u8]) -> (Vec<u8>, u64) {
        let count = self.regex.find_iter(input).count() as u64;
        if count == 0 {
            return (input.to_vec(), 0);
        }
        let out = if self.is_regex {
            self.regex.replace_all(input, self.replacement.as_slice())
        } else {
            self.regex.replace_all(input, NoExpand(&self.replacement))
        };
        (out.into_owned(), count)
    }
}

/// General-purpose literal/regex response rewriter. Rules live in the
/// persistent store; the compiled snapshot swaps atomically on reload so an
/// in-flight filter never observes a partially reloaded set.
pub struct RewritePlugin {
    store: Option<RewriteRuleStore>,
    snapshot: RwLock<Arc<CompiledRuleSet>>,
}

impl RewritePlugin {
    pub fn new() -> Self {
        Self {
            store: None,
            snapshot: RwLock::new(Arc::new(CompiledRuleSet::default())),
        }
    }

    pub fn store(&self) -> Option<&RewriteRuleStore> {
        self.store.as_ref()
    }

    fn swap_snapshot(&self, set: CompiledRuleSet) {
        *self.snapshot.write().unwrap() = Arc::new(set);
    }
}

impl Default for RewritePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentFilter for RewritePlugin {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    fn default_domains(&self) -> &'static [&'static str] {
        &[]
    }

    fn init(&mut self, settings: &PluginSettings) -> Result<(), ProxyError> {
        let path = settings
            .options
            .get("rules_path")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_RULES_PATH)
            .to_string();
        let store = RewriteRuleStore::open(path)?;
        self.swap_snapshot(compile(&store.list()));
        self.store = Some(store);
        Ok(())
    }

    fn reload(&self) -> Result<(), ProxyError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| ProxyError::plugin("rewrite", "reload before init"))?;
        self.swap_snapshot(compile(&store.list()));
        tracing::info!("rewrite rules reloaded");
        Ok(())
    }

    fn filter(
        &self,
        req: &RequestInfo<'_>,
        resp: &ResponseHead,
        body: &[u8],
    ) -> Result<(Option<Vec<u8>>, FilterResult), ProxyError> {
        // Readers hold the snapshot for the duration of one call.
        let snapshot = self.snapshot.read().unwrap().clone();
        if snapshot.rules.is_empty() {
            return Ok((None, FilterResult::unmatched()));
        }
        let essence = content_type_essence(&resp.headers).unwrap_or_default();
        let html = is_html(&essence);

        let mut current: Vec<u8> = body.to_vec();
        let mut hits = Vec::<RuleHit>::new();
        let mut total: u64 = 0;
        for rule in &snapshot.rules {
            if !rule.in_scope(req.host, req.path, &essence) {
                continue;
            }
            let count = if html {
                // Ranges are recomputed per rule: a prior rule may have
                // shifted offsets outside the protected spans.
                let ranges = html_guard::forbidden_ranges(&current);
                let mut count = 0u64;
                let next = html_guard::apply_outside_ranges(&current, &ranges, |seg| {
                    let (out, n) = rule.apply(seg);
                    count += n;
                    out
                });
                if count > 0 {
                    current = next;
                }
                count
            } else {
                let (out, count) = rule.apply(&current);
                if count > 0 {
                    current = out;
                }
                count
            };
            if count > 0 {
                total += count;
                hits.push(RuleHit {
                    rule: rule.name.clone(),
                    count,
                    modified: true,
                });
            }
        }

        if hits.is_empty() {
            return Ok((None, FilterResult::unmatched()));
        }
        let result = FilterResult {
            matched: true,
            modified: true,
            rule: hits[0].rule.clone(),
            removed: total,
            rules: hits,
        };
        Ok((Some(current), result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{PlaceholderMode, PluginMode};
    use crate::rewrite_store::RuleDraft;

    fn settings(path: &std::path::Path) -> PluginSettings {
        PluginSettings {
            mode: PluginMode::Filter,
            placeholder: PlaceholderMode::Visible,
            priority: 100,
            domains: vec!["example.com".into()],
            options: serde_json::json!({"rules_path": path})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    fn plugin_with_rules(drafts: Vec<RuleDraft>) -> (tempfile::TempDir, RewritePlugin) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.json");
        let store = RewriteRuleStore::open(&path).expect("store");
        for draft in drafts {
            store.add(draft).expect("add rule");
        }
        let mut plugin = RewritePlugin::new();
        plugin.init(&settings(&path)).expect("init");
        (dir, plugin)
    }

    fn html_resp() -> ResponseHead {
        ResponseHead {
            status: 200,
            reason: "OK".into(),
            version_minor: 1,
            headers: vec![crate::http1::Header::new("Content-Type", "text/html")],
        }
    }

    fn resp_with_type(ct: &str) -> ResponseHead {
        ResponseHead {
            status: 200,
            reason: "OK".into(),
            version_minor: 1,
            headers: vec![crate::http1::Header::new("Content-Type", ct)],
        }
    }

    fn req<'a>(host: &'a str, path: &'a str) -> RequestInfo<'a> {
        RequestInfo {
            method: "GET",
            host,
            path,
            headers: &[],
        }
    }

    fn literal(name: &str, pattern: &str, replacement: &str) -> RuleDraft {
        RuleDraft {
            name: name.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_rule_set_matches_nothing() {
        let (_dir, plugin) = plugin_with_rules(vec![]);
        let (out, result) = plugin
            .filter(&req("example.com", "/"), &html_resp(), b"foo")
            .expect("filter");
        assert!(out.is_none());
        assert!(!result.matched);
    }

    #[test]
    fn literal_replacement_counts_occurrences() {
        let (_dir, plugin) = plugin_with_rules(vec![literal("foo-bar", "foo", "bar")]);
        let (out, result) = plugin
            .filter(&req("example.com", "/"), &html_resp(), b"foo baz foo")
            .expect("filter");
        assert_eq!(out.expect("modified"), b"bar baz bar");
        assert!(result.matched && result.modified);
        assert_eq!(result.removed, 2);
        assert_eq!(result.rule, "foo-bar");
        assert_eq!(result.rules.len(), 1);
        assert_eq!(result.rules[0].count, 2);
    }

    #[test]
    fn regex_replacement_supports_captures() {
        let mut draft = literal("swap", r"(\w+)-(\w+)", "$2-$1");
        draft.is_regex = true;
        let (_dir, plugin) = plugin_with_rules(vec![draft]);
        let (out, _) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/plain"), b"left-right")
            .expect("filter");
        assert_eq!(out.expect("modified"), b"right-left");
    }

    #[test]
    fn literal_dollar_signs_are_not_expanded() {
        let (_dir, plugin) = plugin_with_rules(vec![literal("price", "cost", "$10")]);
        let (out, _) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/plain"), b"cost")
            .expect("filter");
        assert_eq!(out.expect("modified"), b"$10");
    }

    #[test]
    fn empty_replacement_deletes_matches() {
        let (_dir, plugin) = plugin_with_rules(vec![literal("strip", "junk ", "")]);
        let (out, _) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/plain"), b"junk clean")
            .expect("filter");
        assert_eq!(out.expect("modified"), b"clean");
    }

    #[test]
    fn script_and_style_blocks_are_never_rewritten() {
        let (_dir, plugin) = plugin_with_rules(vec![literal("w", "word", "WORD")]);
        let body = b"<p>word</p><script>var word = 1;</script><p>word</p>";
        let (out, result) = plugin
            .filter(&req("example.com", "/"), &html_resp(), body)
            .expect("filter");
        assert_eq!(
            out.expect("modified"),
            b"<p>WORD</p><script>var word = 1;</script><p>WORD</p>"
        );
        assert_eq!(result.removed, 2);
    }

    #[test]
    fn domain_scope_skips_other_hosts() {
        let mut draft = literal("scoped", "foo", "bar");
        draft.domains = vec!["other.example".into()];
        let (_dir, plugin) = plugin_with_rules(vec![draft]);
        let (out, result) = plugin
            .filter(&req("example.com", "/"), &html_resp(), b"foo")
            .expect("filter");
        assert!(out.is_none());
        assert!(!result.matched);
    }

    #[test]
    fn url_glob_scope_uses_non_slash_star() {
        let mut draft = literal("globbed", "foo", "bar");
        draft.url_patterns = vec!["/news/*".into()];
        let (_dir, plugin) = plugin_with_rules(vec![draft]);
        let hit = plugin
            .filter(&req("example.com", "/news/today"), &html_resp(), b"foo")
            .expect("filter");
        assert!(hit.0.is_some());
        let nested = plugin
            .filter(&req("example.com", "/news/a/b"), &html_resp(), b"foo")
            .expect("filter");
        assert!(nested.0.is_none(), "star must not cross slashes");
        let miss = plugin
            .filter(&req("example.com", "/sports/today"), &html_resp(), b"foo")
            .expect("filter");
        assert!(miss.0.is_none());
    }

    #[test]
    fn default_content_scope_skips_structured_payloads() {
        let (_dir, plugin) = plugin_with_rules(vec![literal("r", "foo", "bar")]);
        for skipped in ["application/json", "application/javascript", "application/xml"] {
            let (out, _) = plugin
                .filter(&req("example.com", "/"), &resp_with_type(skipped), b"foo")
                .expect("filter");
            assert!(out.is_none(), "{skipped} must be skipped by default");
        }
        for allowed in ["text/plain", "text/html", "application/vnd.site+html", "text/csv"] {
            let (out, _) = plugin
                .filter(&req("example.com", "/"), &resp_with_type(allowed), b"foo")
                .expect("filter");
            assert!(out.is_some(), "{allowed} must be in the default scope");
        }
    }

    #[test]
    fn declared_content_types_override_the_default_scope() {
        let mut draft = literal("json-ok", "foo", "bar");
        draft.content_types = vec!["application/json".into()];
        let (_dir, plugin) = plugin_with_rules(vec![draft]);
        let (out, _) = plugin
            .filter(
                &req("example.com", "/"),
                &resp_with_type("application/json; charset=utf-8"),
                b"foo",
            )
            .expect("filter");
        assert!(out.is_some());
        let (out, _) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/html"), b"foo")
            .expect("filter");
        assert!(out.is_none());
    }

    #[test]
    fn rules_apply_sequentially_with_per_rule_hits() {
        let (_dir, plugin) = plugin_with_rules(vec![
            literal("first", "aaa", "bbb"),
            literal("second", "bbb", "ccc"),
        ]);
        let (out, result) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/plain"), b"aaa")
            .expect("filter");
        assert_eq!(out.expect("modified"), b"ccc");
        assert_eq!(result.rule, "first");
        assert_eq!(result.rules.len(), 2);
    }

    #[test]
    fn hot_reload_picks_up_new_rules() {
        let (_dir, plugin) = plugin_with_rules(vec![]);
        let (out, _) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/plain"), b"foo")
            .expect("filter");
        assert!(out.is_none());

        plugin
            .store()
            .expect("store")
            .add(literal("late", "foo", "bar"))
            .expect("add");
        plugin.reload().expect("reload");

        let (out, _) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/plain"), b"foo")
            .expect("filter");
        assert_eq!(out.expect("modified"), b"bar");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut draft = literal("off", "foo", "bar");
        draft.enabled = false;
        let (_dir, plugin) = plugin_with_rules(vec![draft]);
        let (out, _) = plugin
            .filter(&req("example.com", "/"), &resp_with_type("text/plain"), b"foo")
            .expect("filter");
        assert!(out.is_none());
    }
}
