use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::har::{EndpointKey, MalformedRecording, RecordedExchange};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingSetId(String);

impl RecordingSetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("har_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordingSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchanges loaded together from one HAR file; removable only as a unit.
#[derive(Debug, Clone)]
pub struct RecordingSet {
    pub id: RecordingSetId,
    pub name: String,
    pub exchanges: Vec<Arc<RecordedExchange>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingSetInfo {
    pub id: RecordingSetId,
    pub name: String,
    pub entries: usize,
}

/// Recorded exchanges for one endpoint plus the cursor naming the exchange that answers
/// the next matching request.
///
/// The cursor satisfies `cursor < exchanges.len()` whenever the list is non-empty. After
/// each fulfillment it moves to `(cursor + 1) % len`, so an endpoint with N recordings
/// answers request N+1 with its first recording again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayState {
    exchanges: Vec<Arc<RecordedExchange>>,
    cursor: usize,
}

impl ReplayState {
    pub fn exchanges(&self) -> &[Arc<RecordedExchange>] {
        &self.exchanges
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    fn push(&mut self, exchange: Arc<RecordedExchange>) {
        self.exchanges.push(exchange);
    }

    fn take_next(&mut self) -> Option<Arc<RecordedExchange>> {
        let exchange = self.exchanges.get(self.cursor).cloned()?;
        self.cursor = (self.cursor + 1) % self.exchanges.len();
        Some(exchange)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSummary {
    pub method: String,
    pub path: String,
    pub count: usize,
    pub cursor: usize,
}

#[derive(Debug)]
pub struct SkippedEntry {
    pub index: usize,
    pub reason: MalformedRecording,
}

#[derive(Debug)]
pub struct LoadReport {
    pub set: RecordingSetInfo,
    pub skipped: Vec<SkippedEntry>,
}

impl LoadReport {
    pub fn loaded(&self) -> usize {
        self.set.entries
    }
}

/// In-memory replay index keyed by (method, path).
///
/// Recording sets are kept in load order. Removing a set rebuilds every endpoint from the
/// remaining sets, which costs O(total entries) and resets all cursors.
#[derive(Debug, Default)]
pub struct ReplayIndex {
    sets: Vec<RecordingSet>,
    states: BTreeMap<EndpointKey, ReplayState>,
}

impl ReplayIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a recording set built from raw HAR entries. Malformed entries are skipped one at
    /// a time and reported; they never abort the load.
    pub fn load(
        &mut self,
        id: RecordingSetId,
        name: impl Into<String>,
        entries: &[Value],
    ) -> LoadReport {
        let name = name.into();
        let mut exchanges = Vec::with_capacity(entries.len());
        let mut skipped = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            match RecordedExchange::from_har_entry(entry) {
                Ok(exchange) => exchanges.push(Arc::new(exchange)),
                Err(reason) => {
                    tracing::debug!(
                        set_id = %id,
                        entry_index = index,
                        kind = reason.kind(),
                        "skipping malformed HAR entry: {reason}"
                    );
                    skipped.push(SkippedEntry { index, reason });
                }
            }
        }

        for exchange in &exchanges {
            self.states
                .entry(exchange.key.clone())
                .or_default()
                .push(Arc::clone(exchange));
        }

        let set = RecordingSet {
            id,
            name,
            exchanges,
        };
        let info = set_info(&set);
        self.sets.push(set);

        LoadReport { set: info, skipped }
    }

    /// Removes a set and rebuilds the index from the remaining ones. Returns `false` when no
    /// set has that id.
    pub fn unload(&mut self, id: &RecordingSetId) -> bool {
        let before = self.sets.len();
        self.sets.retain(|set| &set.id != id);
        if self.sets.len() == before {
            return false;
        }
        self.rebuild();
        true
    }

    pub fn rebuild(&mut self) {
        self.states.clear();
        for set in &self.sets {
            for exchange in &set.exchanges {
                self.states
                    .entry(exchange.key.clone())
                    .or_default()
                    .push(Arc::clone(exchange));
            }
        }
    }

    pub fn lookup(&self, key: &EndpointKey) -> Option<&ReplayState> {
        self.states.get(key)
    }

    /// Returns the exchange under the endpoint's cursor and advances the cursor.
    pub fn consume_next(&mut self, key: &EndpointKey) -> Option<Arc<RecordedExchange>> {
        self.states.get_mut(key)?.take_next()
    }

    pub fn endpoint_summary(&self, key: &EndpointKey) -> Option<EndpointSummary> {
        self.states.get(key).map(|state| summarize(key, state))
    }

    /// Endpoints sorted by path, then method.
    pub fn list_endpoints(&self) -> Vec<EndpointSummary> {
        let mut endpoints: Vec<EndpointSummary> = self
            .states
            .iter()
            .map(|(key, state)| summarize(key, state))
            .collect();
        endpoints.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.method.cmp(&b.method)));
        endpoints
    }

    pub fn recording_sets(&self) -> Vec<RecordingSetInfo> {
        self.sets.iter().map(set_info).collect()
    }

    pub fn contains_set(&self, id: &RecordingSetId) -> bool {
        self.sets.iter().any(|set| &set.id == id)
    }
}

fn summarize(key: &EndpointKey, state: &ReplayState) -> EndpointSummary {
    EndpointSummary {
        method: key.method.clone(),
        path: key.path.clone(),
        count: state.len(),
        cursor: state.cursor(),
    }
}

fn set_info(set: &RecordingSet) -> RecordingSetInfo {
    RecordingSetInfo {
        id: set.id.clone(),
        name: set.name.clone(),
        entries: set.exchanges.len(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{RecordingSetId, ReplayIndex};
    use crate::har::EndpointKey;

    fn entry(method: &str, url: &str, body: &str) -> Value {
        json!({
            "request": { "method": method, "url": url },
            "response": {
                "status": 200,
                "headers": [],
                "content": { "text": body }
            }
        })
    }

    fn body_of(index: &mut ReplayIndex, key: &EndpointKey) -> String {
        index
            .consume_next(key)
            .and_then(|exchange| exchange.body.clone())
            .map(|body| body.content)
            .expect("exchange with body should exist")
    }

    #[test]
    fn consume_next_cycles_round_robin_in_load_order() {
        let mut index = ReplayIndex::new();
        index.load(
            RecordingSetId::new("a"),
            "a.har",
            &[
                entry("GET", "https://e.com/api/x", "r1"),
                entry("GET", "https://e.com/api/x?page=2", "r2"),
                entry("GET", "https://e.com/api/x", "r3"),
            ],
        );
        let key = EndpointKey::new("GET", "/api/x");

        let order: Vec<String> = (0..5).map(|_| body_of(&mut index, &key)).collect();
        assert_eq!(order, ["r1", "r2", "r3", "r1", "r2"]);
    }

    #[test]
    fn single_recording_answers_every_request() {
        let mut index = ReplayIndex::new();
        index.load(
            RecordingSetId::new("a"),
            "a.har",
            &[entry("GET", "https://e.com/one", "only")],
        );
        let key = EndpointKey::new("GET", "/one");
        for _ in 0..3 {
            assert_eq!(body_of(&mut index, &key), "only");
        }
        assert_eq!(index.lookup(&key).map(|state| state.cursor()), Some(0));
    }

    #[test]
    fn later_sets_append_after_earlier_sets() {
        let mut index = ReplayIndex::new();
        index.load(
            RecordingSetId::new("a"),
            "a.har",
            &[
                entry("GET", "https://e.com/x", "a1"),
                entry("GET", "https://e.com/x", "a2"),
            ],
        );
        index.load(
            RecordingSetId::new("b"),
            "b.har",
            &[entry("GET", "https://other.test/x", "b1")],
        );
        let key = EndpointKey::new("GET", "/x");
        let order: Vec<String> = (0..3).map(|_| body_of(&mut index, &key)).collect();
        assert_eq!(order, ["a1", "a2", "b1"]);
    }

    #[test]
    fn unload_matches_index_built_without_that_set() {
        let first = [
            entry("GET", "https://e.com/x", "a1"),
            entry("POST", "https://e.com/y", "a2"),
        ];
        let second = [
            entry("GET", "https://e.com/x", "b1"),
            entry("GET", "https://e.com/z", "b2"),
        ];
        let third = [entry("GET", "https://e.com/x", "c1")];

        let mut index = ReplayIndex::new();
        index.load(RecordingSetId::new("a"), "a.har", &first);
        index.load(RecordingSetId::new("b"), "b.har", &second);
        index.load(RecordingSetId::new("c"), "c.har", &third);
        assert!(index.unload(&RecordingSetId::new("b")));

        let mut expected = ReplayIndex::new();
        expected.load(RecordingSetId::new("a"), "a.har", &first);
        expected.load(RecordingSetId::new("c"), "c.har", &third);

        assert_eq!(index.list_endpoints(), expected.list_endpoints());
        for key in [
            EndpointKey::new("GET", "/x"),
            EndpointKey::new("POST", "/y"),
            EndpointKey::new("GET", "/z"),
        ] {
            assert_eq!(index.lookup(&key), expected.lookup(&key), "key: {key:?}");
        }
        assert_eq!(index.recording_sets(), expected.recording_sets());
    }

    #[test]
    fn unload_unknown_set_is_reported_and_keeps_cursors() {
        let mut index = ReplayIndex::new();
        index.load(
            RecordingSetId::new("a"),
            "a.har",
            &[
                entry("GET", "https://e.com/x", "a1"),
                entry("GET", "https://e.com/x", "a2"),
            ],
        );
        let key = EndpointKey::new("GET", "/x");
        index.consume_next(&key);

        assert!(!index.unload(&RecordingSetId::new("missing")));
        assert_eq!(index.lookup(&key).map(|state| state.cursor()), Some(1));
    }

    #[test]
    fn load_skips_malformed_entries_and_reports_them() {
        let mut index = ReplayIndex::new();
        let report = index.load(
            RecordingSetId::new("a"),
            "a.har",
            &[
                entry("GET", "https://e.com/ok", "fine"),
                json!({ "request": { "method": "GET", "url": "https://e.com/no-response" } }),
                json!(42),
                entry("GET", "https://e.com/ok2", "fine"),
            ],
        );

        assert_eq!(report.loaded(), 2);
        let skipped: Vec<(usize, &str)> = report
            .skipped
            .iter()
            .map(|skipped| (skipped.index, skipped.reason.kind()))
            .collect();
        assert_eq!(skipped, [(1, "missing_response"), (2, "invalid_shape")]);
        assert_eq!(index.list_endpoints().len(), 2);
    }

    #[test]
    fn consume_next_returns_none_for_unknown_endpoint() {
        let mut index = ReplayIndex::new();
        assert!(index.consume_next(&EndpointKey::new("GET", "/nothing")).is_none());
    }

    #[test]
    fn list_endpoints_sorts_by_path_then_method_and_reports_cursor() {
        let mut index = ReplayIndex::new();
        index.load(
            RecordingSetId::new("a"),
            "a.har",
            &[
                entry("POST", "https://e.com/b", "1"),
                entry("GET", "https://e.com/b", "2"),
                entry("DELETE", "https://e.com/a", "3"),
                entry("GET", "https://e.com/b", "4"),
            ],
        );
        index.consume_next(&EndpointKey::new("GET", "/b"));

        let listed: Vec<(String, String, usize, usize)> = index
            .list_endpoints()
            .into_iter()
            .map(|endpoint| (endpoint.method, endpoint.path, endpoint.count, endpoint.cursor))
            .collect();
        assert_eq!(
            listed,
            [
                ("DELETE".to_owned(), "/a".to_owned(), 1, 0),
                ("GET".to_owned(), "/b".to_owned(), 2, 1),
                ("POST".to_owned(), "/b".to_owned(), 1, 0),
            ]
        );
    }
}
