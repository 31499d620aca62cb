use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::ProxyError;

pub const MAX_RULE_NAME_LEN: usize = 200;

/// One persistent rewrite rule record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub id: String,
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    pub is_regex: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub content_types: Vec<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Rule fields supplied by callers; ids and timestamps are stamped by the
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for RuleDraft {
    fn default() -> Self {
        Self {
            name: String::new(),
            pattern: String::new(),
            replacement: String::new(),
            is_regex: false,
            domains: Vec::new(),
            url_patterns: Vec::new(),
            content_types: Vec::new(),
            enabled: true,
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "".into())
}

fn validate(draft: &RuleDraft) -> Result<(), ProxyError> {
    if draft.name.trim().is_empty() {
        return Err(ProxyError::InvalidRule("name is required".into()));
    }
    if draft.name.len() > MAX_RULE_NAME_LEN {
        return Err(ProxyError::InvalidRule(format!(
            "name exceeds {MAX_RULE_NAME_LEN} characters"
        )));
    }
    if draft.pattern.is_empty() {
        return Err(ProxyError::InvalidRule("pattern is required".into()));
    }
    if draft.is_regex {
        regex::bytes::Regex::new(&draft.pattern)
            .map_err(|e| ProxyError::InvalidRule(format!("pattern does not compile: {e}")))?;
    }
    Ok(())
}

/// JSON-file-backed CRUD for rewrite rules. All mutations are serialized
/// behind the inner mutex and rewritten atomically (tempfile + rename).
/// The compiled cache in the rewrite plugin is independent; callers invoke
/// the plugin's reload hook after any mutation.
pub struct RewriteRuleStore {
    path: PathBuf,
    inner: Mutex<Vec<RewriteRule>>,
}

impl RewriteRuleStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProxyError> {
        let path = path.into();
        let rules = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ProxyError::Store(format!("cannot read {}: {e}", path.display())))?;
            serde_json::from_str::<Vec<RewriteRule>>(&raw)
                .map_err(|e| ProxyError::Store(format!("cannot parse {}: {e}", path.display())))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(rules),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All rules ordered by creation time.
    pub fn list(&self) -> Vec<RewriteRule> {
        let mut rules = self.inner.lock().unwrap().clone();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rules
    }

    pub fn get(&self, id: &str) -> Result<RewriteRule, ProxyError> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| ProxyError::RuleNotFound(id.to_string()))
    }

    pub fn add(&self, draft: RuleDraft) -> Result<RewriteRule, ProxyError> {
        validate(&draft)?;
        let now = now_rfc3339();
        let rule = RewriteRule {
            id: uuid::Uuid::new_v4().to_string(),
            name: draft.name,
            pattern: draft.pattern,
            replacement: draft.replacement,
            is_regex: draft.is_regex,
            domains: draft.domains,
            url_patterns: draft.url_patterns,
            content_types: draft.content_types,
            enabled: draft.enabled,
            created_at: now.clone(),
            updated_at: now,
        };
        let mut rules = self.inner.lock().unwrap();
        rules.push(rule.clone());
        self.persist(&rules)?;
        Ok(rule)
    }

    pub fn update(&self, id: &str, draft: RuleDraft) -> Result<RewriteRule, ProxyError> {
        validate(&draft)?;
        let mut rules = self.inner.lock().unwrap();
        let slot = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ProxyError::RuleNotFound(id.to_string()))?;
        slot.name = draft.name;
        slot.pattern = draft.pattern;
        slot.replacement = draft.replacement;
        slot.is_regex = draft.is_regex;
        slot.domains = draft.domains;
        slot.url_patterns = draft.url_patterns;
        slot.content_types = draft.content_types;
        slot.enabled = draft.enabled;
        slot.updated_at = now_rfc3339();
        let updated = slot.clone();
        self.persist(&rules)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), ProxyError> {
        let mut rules = self.inner.lock().unwrap();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(ProxyError::RuleNotFound(id.to_string()));
        }
        self.persist(&rules)
    }

    /// Flips `enabled` and returns the updated record.
    pub fn toggle(&self, id: &str) -> Result<RewriteRule, ProxyError> {
        let mut rules = self.inner.lock().unwrap();
        let slot = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ProxyError::RuleNotFound(id.to_string()))?;
        slot.enabled = !slot.enabled;
        slot.updated_at = now_rfc3339();
        let updated = slot.clone();
        self.persist(&rules)?;
        Ok(updated)
    }

    fn persist(&self, rules: &[RewriteRule]) -> Result<(), ProxyError> {
        let json = serde_json::to_string_pretty(rules)
            .map_err(|e| ProxyError::Store(e.to_string()))?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| ProxyError::Store(e.to_string()))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| ProxyError::Store(e.to_string()))?;
        std::fs::write(tmp.path(), json).map_err(|e| ProxyError::Store(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| ProxyError::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, RewriteRuleStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RewriteRuleStore::open(dir.path().join("rules.json")).expect("open");
        (dir, store)
    }

    fn draft(name: &str, pattern: &str) -> RuleDraft {
        RuleDraft {
            name: name.into(),
            pattern: pattern.into(),
            replacement: "x".into(),
            ..RuleDraft::default()
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let (_dir, store) = store();
        let added = store.add(draft("strip-foo", "foo")).expect("add");
        let fetched = store.get(&added.id).expect("get");
        assert_eq!(added, fetched);
        assert!(!fetched.id.is_empty());
        assert!(!fetched.created_at.is_empty());
        assert_eq!(fetched.created_at, fetched.updated_at);
    }

    #[test]
    fn update_preserves_created_at() {
        let (_dir, store) = store();
        let added = store.add(draft("a", "foo")).expect("add");
        let mut d = draft("a-renamed", "bar");
        d.enabled = false;
        let updated = store.update(&added.id, d).expect("update");
        assert_eq!(updated.created_at, added.created_at);
        assert_eq!(updated.name, "a-renamed");
        assert_eq!(updated.pattern, "bar");
        assert!(!updated.enabled);
    }

    #[test]
    fn toggle_twice_restores_flag() {
        let (_dir, store) = store();
        let added = store.add(draft("t", "p")).expect("add");
        assert!(added.enabled);
        let once = store.toggle(&added.id).expect("toggle");
        assert!(!once.enabled);
        let twice = store.toggle(&added.id).expect("toggle");
        assert!(twice.enabled);
    }

    #[test]
    fn mutations_on_missing_ids_fail() {
        let (_dir, store) = store();
        assert!(matches!(store.get("nope"), Err(ProxyError::RuleNotFound(_))));
        assert!(matches!(store.delete("nope"), Err(ProxyError::RuleNotFound(_))));
        assert!(matches!(store.toggle("nope"), Err(ProxyError::RuleNotFound(_))));
        assert!(matches!(
            store.update("nope", draft("n", "p")),
            Err(ProxyError::RuleNotFound(_))
        ));
    }

    #[test]
    fn invalid_drafts_are_rejected_and_not_persisted() {
        let (_dir, store) = store();
        assert!(store.add(draft("", "p")).is_err());
        assert!(store.add(draft("n", "")).is_err());
        let mut bad_regex = draft("n", "(unclosed");
        bad_regex.is_regex = true;
        assert!(matches!(
            store.add(bad_regex),
            Err(ProxyError::InvalidRule(_))
        ));
        let long_name = draft(&"x".repeat(MAX_RULE_NAME_LEN + 1), "p");
        assert!(store.add(long_name).is_err());
        assert!(store.list().is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.json");
        let store = RewriteRuleStore::open(&path).expect("open");
        let added = store.add(draft("keep", "foo")).expect("add");
        drop(store);
        let reopened = RewriteRuleStore::open(&path).expect("reopen");
        assert_eq!(reopened.list(), vec![added]);
    }

    #[test]
    fn list_orders_by_creation_time() {
        let (_dir, store) = store();
        let a = store.add(draft("first", "a")).expect("add");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = store.add(draft("second", "b")).expect("add");
        let listed = store.list();
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);
    }
}
