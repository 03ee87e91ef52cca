//! BLF watcher index
//!
//! Maps a normalized monitored URI to the dialogs watching it, with a
//! reverse map so removal by dialog id is cheap. Reads vastly outnumber
//! writes (every presence event does a lookup), so the two maps live behind
//! one reader-writer lock and lookups return owned snapshots.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

/// One watcher of a monitored URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEntry {
    pub dialog_id: String,
    pub tenant_id: String,
}

#[derive(Default)]
struct IndexInner {
    watchers_by_uri: HashMap<String, Vec<WatcherEntry>>,
    uri_by_dialog: HashMap<String, String>,
}

impl IndexInner {
    fn detach(&mut self, uri: &str, dialog_id: &str) {
        if let Some(watchers) = self.watchers_by_uri.get_mut(uri) {
            watchers.retain(|w| w.dialog_id != dialog_id);
            if watchers.is_empty() {
                self.watchers_by_uri.remove(uri);
            }
        }
    }
}

/// Monitored-URI -> watchers fanout table
#[derive(Default)]
pub struct WatcherIndex {
    inner: RwLock<IndexInner>,
}

impl WatcherIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a watcher. No-op when already present under the same
    /// normalized URI; moves the entry atomically when the URI changed.
    pub fn add(&self, monitored_uri: &str, dialog_id: &str, tenant_id: &str) {
        if monitored_uri.is_empty() || dialog_id.is_empty() {
            warn!("watcher index add with empty uri or dialog id");
            return;
        }
        let uri = normalize_uri(monitored_uri);

        let mut inner = self.inner.write().unwrap();
        if let Some(previous) = inner.uri_by_dialog.get(dialog_id).cloned() {
            if previous == uri {
                return;
            }
            inner.detach(&previous, dialog_id);
        }

        inner
            .watchers_by_uri
            .entry(uri.clone())
            .or_default()
            .push(WatcherEntry {
                dialog_id: dialog_id.to_string(),
                tenant_id: tenant_id.to_string(),
            });
        inner.uri_by_dialog.insert(dialog_id.to_string(), uri.clone());

        debug!(dialog = dialog_id, uri = %uri, "watcher indexed");
    }

    /// Idempotent removal by URI + dialog
    pub fn remove(&self, monitored_uri: &str, dialog_id: &str) {
        let uri = normalize_uri(monitored_uri);
        let mut inner = self.inner.write().unwrap();
        inner.detach(&uri, dialog_id);
        inner.uri_by_dialog.remove(dialog_id);
        debug!(dialog = dialog_id, uri = %uri, "watcher removed");
    }

    /// Idempotent removal knowing only the dialog id
    pub fn remove_dialog(&self, dialog_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(uri) = inner.uri_by_dialog.remove(dialog_id) {
            inner.detach(&uri, dialog_id);
        }
    }

    /// Snapshot of all watchers of a URI
    pub fn lookup(&self, monitored_uri: &str) -> Vec<WatcherEntry> {
        let uri = normalize_uri(monitored_uri);
        self.inner
            .read()
            .unwrap()
            .watchers_by_uri
            .get(&uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot filtered to one tenant
    pub fn lookup_tenant(&self, monitored_uri: &str, tenant_id: &str) -> Vec<WatcherEntry> {
        let mut watchers = self.lookup(monitored_uri);
        watchers.retain(|w| w.tenant_id == tenant_id);
        watchers
    }

    /// The normalized URI a dialog is indexed under, if any
    pub fn uri_for_dialog(&self, dialog_id: &str) -> Option<String> {
        self.inner.read().unwrap().uri_by_dialog.get(dialog_id).cloned()
    }

    pub fn monitored_uri_count(&self) -> usize {
        self.inner.read().unwrap().watchers_by_uri.len()
    }

    pub fn total_watcher_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .watchers_by_uri
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Canonicalize a SIP URI for use as an index key.
///
/// Steps, in order: strip surrounding angle brackets, truncate at the first
/// `;`, drop an explicit default port (5060), lowercase the scheme and the
/// host (user case is preserved), and prepend `sip:` when no scheme is
/// present. Empty input maps to empty output; never fails.
pub fn normalize_uri(uri: &str) -> String {
    if uri.is_empty() {
        return String::new();
    }

    let mut normalized = uri.to_string();

    if normalized.starts_with('<') {
        normalized.remove(0);
    }
    if normalized.ends_with('>') {
        normalized.pop();
    }

    if let Some(semi) = normalized.find(';') {
        normalized.truncate(semi);
    }

    if let Some(at) = normalized.find('@') {
        if let Some(colon) = normalized[at..].find(':').map(|i| at + i) {
            if &normalized[colon + 1..] == "5060" {
                normalized.truncate(colon);
            }
        }
    }

    // Lowercase the scheme (everything up to the first ':') and the host
    // (everything after '@'); the user part keeps its case
    let at = normalized.find('@');
    if let Some(colon) = normalized.find(':') {
        if at.map_or(true, |a| colon < a) {
            normalized.as_mut_str()[..=colon].make_ascii_lowercase();
        }
    }
    if let Some(at) = at {
        normalized.as_mut_str()[at + 1..].make_ascii_lowercase();
    }

    if !normalized.starts_with("sip:") && !normalized.starts_with("sips:") {
        normalized = format!("sip:{normalized}");
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_brackets_and_params() {
        assert_eq!(
            normalize_uri("<sip:200@TEST.COM;transport=tcp>"),
            "sip:200@test.com"
        );
    }

    #[test]
    fn test_normalize_drops_default_port() {
        assert_eq!(normalize_uri("sip:200@test.com:5060"), "sip:200@test.com");
        // Non-default ports stay
        assert_eq!(normalize_uri("sip:200@test.com:5070"), "sip:200@test.com:5070");
    }

    #[test]
    fn test_normalize_adds_scheme() {
        assert_eq!(normalize_uri("200@test.com"), "sip:200@test.com");
        assert_eq!(normalize_uri("sips:200@test.com"), "sips:200@test.com");
    }

    #[test]
    fn test_normalize_preserves_user_case() {
        assert_eq!(normalize_uri("sip:User@HOST.COM"), "sip:User@host.com");
        assert_eq!(normalize_uri("SIP:User@HOST.COM"), "sip:User@host.com");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in [
            "<sip:200@TEST.COM;transport=tcp>",
            "sip:200@test.com:5060",
            "200@test.com",
            "sip:User@HOST.COM",
            "",
            ">",
            "sips:Mixed@Case.Org:5090",
        ] {
            let once = normalize_uri(input);
            assert_eq!(normalize_uri(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_add_lookup_remove() {
        let index = WatcherIndex::new();
        index.add("sip:200@TEST.com", "d1", "test.com");
        index.add("<sip:200@test.com:5060>", "d2", "test.com");

        let watchers = index.lookup("200@test.com");
        assert_eq!(watchers.len(), 2);

        index.remove("sip:200@test.com", "d1");
        assert_eq!(index.lookup("sip:200@test.com").len(), 1);

        index.remove_dialog("d2");
        assert!(index.lookup("sip:200@test.com").is_empty());
        assert_eq!(index.monitored_uri_count(), 0);
    }

    #[test]
    fn test_add_is_idempotent_and_moves_on_uri_change() {
        let index = WatcherIndex::new();
        index.add("sip:200@test.com", "d1", "test.com");
        index.add("sip:200@TEST.COM:5060", "d1", "test.com");
        assert_eq!(index.lookup("sip:200@test.com").len(), 1);
        assert_eq!(index.total_watcher_count(), 1);

        index.add("sip:300@test.com", "d1", "test.com");
        assert!(index.lookup("sip:200@test.com").is_empty());
        assert_eq!(index.lookup("sip:300@test.com").len(), 1);
        assert_eq!(index.uri_for_dialog("d1").as_deref(), Some("sip:300@test.com"));
    }

    #[test]
    fn test_empty_arguments_are_noops() {
        let index = WatcherIndex::new();
        index.add("", "d1", "t");
        index.add("sip:200@test.com", "", "t");
        assert_eq!(index.total_watcher_count(), 0);
        index.remove("", "d1");
        index.remove_dialog("");
    }

    #[test]
    fn test_tenant_filtered_lookup() {
        let index = WatcherIndex::new();
        index.add("sip:200@test.com", "d1", "a.com");
        index.add("sip:200@test.com", "d2", "b.com");
        let only_a = index.lookup_tenant("sip:200@test.com", "a.com");
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].dialog_id, "d1");
    }
}
