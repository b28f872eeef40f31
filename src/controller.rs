use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    config::ReplayConfig,
    fulfillment::{self, Action, LiveRequest},
    har,
    index::{EndpointSummary, LoadReport, RecordingSetId, RecordingSetInfo, ReplayIndex},
    interception::{
        AttachError, AttachOutcome, CapabilityError, DetachOutcome, FulfillError,
        InterceptionCapability, InterceptionSessions, PausedRequestId, TabId, Unanswered,
    },
    navigation::{NavEffect, NavigationRedirector, TabControl},
    storage::KeyValueStore,
};

const ACTIVE_KEY: &str = "replay.active";
const SETS_KEY: &str = "replay.sets";
const SET_KEY_PREFIX: &str = "replay.set.";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the controller needs from the browser.
pub trait Browser: InterceptionCapability + TabControl {}

impl<T: InterceptionCapability + TabControl + ?Sized> Browser for T {}

#[derive(Debug, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BrowserEvent {
    BeforeNavigate {
        tab_id: TabId,
        frame_id: i64,
        url: String,
    },
    NavigationCompleted {
        tab_id: TabId,
        frame_id: i64,
        url: String,
    },
    TabClosed {
        tab_id: TabId,
    },
    RequestPaused {
        tab_id: TabId,
        request_id: PausedRequestId,
        request: LiveRequest,
    },
    /// The browser ended the session itself (debugging banner dismissed, tab crashed).
    DebuggerDetached {
        tab_id: TabId,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ControlCommand {
    EnableReplay,
    DisableReplay,
    EnableTab { tab_id: TabId },
    DisableTab { tab_id: TabId },
    LoadRecordingSet { name: String, har: Value },
    UnloadRecordingSet { id: RecordingSetId },
    GetSnapshot,
    ListEndpoints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub active: bool,
    pub recording_sets: Vec<RecordingSetInfo>,
    pub endpoints: Vec<EndpointSummary>,
    pub attached_tabs: Vec<TabId>,
    pub opted_in_tabs: Vec<TabId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ControlEvent {
    Snapshot(Snapshot),
    /// A fulfillment moved an endpoint's cursor.
    EndpointAdvanced(EndpointSummary),
}

#[derive(Debug)]
pub enum ControlError {
    InvalidHar { name: String },
    UnknownRecordingSet(RecordingSetId),
    TabNotReplayable { tab: TabId, url: Option<String> },
    Attach(AttachError),
    Browser(CapabilityError),
}

impl ControlError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidHar { .. } => "invalid_har",
            Self::UnknownRecordingSet(_) => "unknown_recording_set",
            Self::TabNotReplayable { .. } => "tab_not_replayable",
            Self::Attach(_) => "attach_failed",
            Self::Browser(_) => "browser_error",
        }
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHar { name } => {
                write!(f, "`{name}` is not a HAR document: missing `log.entries` array")
            }
            Self::UnknownRecordingSet(id) => write!(f, "no recording set with id `{id}`"),
            Self::TabNotReplayable { tab, url } => match url {
                Some(url) => write!(f, "tab {tab} shows `{url}`, which cannot be replayed"),
                None => write!(f, "tab {tab} has no url that can be replayed"),
            },
            Self::Attach(err) => write!(f, "{err}"),
            Self::Browser(err) => write!(f, "browser command failed: {err}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Attach(err) => Some(err),
            Self::Browser(err) => Some(err),
            Self::InvalidHar { .. } | Self::UnknownRecordingSet(_) | Self::TabNotReplayable { .. } => {
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub neutral_page_url: String,
    pub pause_patterns: Vec<String>,
    pub ignored_url_prefixes: Vec<String>,
    pub detour_timeout: Option<Duration>,
    pub start_active: Option<bool>,
}

impl ControllerOptions {
    pub fn from_config(
        replay: &ReplayConfig,
        extension_origin: Option<&str>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            neutral_page_url: replay.neutral_page_url(extension_origin)?,
            pause_patterns: replay.pause_patterns.clone(),
            ignored_url_prefixes: replay.ignored_url_prefixes.clone(),
            detour_timeout: replay.detour_timeout(),
            start_active: replay.start_active,
        })
    }
}

struct ControllerState {
    active: bool,
    opted_in: BTreeSet<TabId>,
    index: ReplayIndex,
    navigation: NavigationRedirector,
}

impl ControllerState {
    fn replay_active_for(&self, tab: TabId) -> bool {
        self.active || self.opted_in.contains(&tab)
    }
}

#[derive(Debug, Deserialize)]
struct StoredSet {
    id: RecordingSetId,
    name: String,
}

#[derive(Debug, Default)]
struct PersistedState {
    active: Option<bool>,
    sets: Vec<PersistedSet>,
}

#[derive(Debug)]
struct PersistedSet {
    id: RecordingSetId,
    name: String,
    document: Value,
}

/// Process-wide replay state and the commands that drive it.
///
/// Every state transition happens synchronously under one lock that is released before
/// any browser or storage call. Browser commands triggered by an event run on a task
/// spawned per event, so the caller can keep delivering events in arrival order.
pub struct ReplayController<B: ?Sized> {
    sessions: InterceptionSessions<B>,
    state: Mutex<ControllerState>,
    start_active: Option<bool>,
    store: Option<KeyValueStore>,
    events: broadcast::Sender<ControlEvent>,
}

impl<B: Browser + ?Sized + 'static> ReplayController<B> {
    pub fn new(
        browser: Arc<B>,
        options: ControllerOptions,
        store: Option<KeyValueStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            sessions: InterceptionSessions::new(browser, options.pause_patterns),
            state: Mutex::new(ControllerState {
                active: false,
                opted_in: BTreeSet::new(),
                index: ReplayIndex::new(),
                navigation: NavigationRedirector::new(
                    options.neutral_page_url,
                    options.ignored_url_prefixes,
                    options.detour_timeout,
                ),
            }),
            start_active: options.start_active,
            store,
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn browser(&self) -> &Arc<B> {
        self.sessions.capability()
    }

    pub fn sessions(&self) -> &InterceptionSessions<B> {
        &self.sessions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state();
        Snapshot {
            active: state.active,
            recording_sets: state.index.recording_sets(),
            endpoints: state.index.list_endpoints(),
            attached_tabs: self.sessions.attached_tabs(),
            opted_in_tabs: state.opted_in.iter().copied().collect(),
        }
    }

    pub fn list_endpoints(&self) -> Vec<EndpointSummary> {
        self.state().index.list_endpoints()
    }

    pub fn recording_sets(&self) -> Vec<RecordingSetInfo> {
        self.state().index.recording_sets()
    }

    fn publish_snapshot(&self) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let _ = self.events.send(ControlEvent::Snapshot(self.snapshot()));
    }

    /// Loads persisted state, treating unavailable storage as empty, and attaches to every
    /// replayable tab when replay starts out active.
    pub async fn restore(&self) {
        if self.restore_state().await {
            self.attach_replayable_tabs().await;
        }
    }

    /// The storage half of [`Self::restore`]. Returns whether replay is active afterwards.
    pub async fn restore_state(&self) -> bool {
        let persisted = match self.store.as_ref() {
            None => PersistedState::default(),
            Some(store) => match load_persisted(store).await {
                Ok(persisted) => persisted,
                Err(err) => {
                    tracing::warn!("replay state unavailable, starting empty: {err:#}");
                    PersistedState::default()
                }
            },
        };

        let active = self.start_active.or(persisted.active).unwrap_or(false);
        let restored_sets = {
            let mut state = self.state();
            state.active = active;
            let mut restored = 0;
            for set in persisted.sets {
                let Some(entries) = har::har_entries(&set.document) else {
                    tracing::warn!(set_id = %set.id, "stored recording set is not a HAR document");
                    continue;
                };
                let report = state.index.load(set.id, set.name, entries);
                tracing::debug!(
                    set_id = %report.set.id,
                    loaded = report.loaded(),
                    skipped = report.skipped.len(),
                    "restored recording set"
                );
                restored += 1;
            }
            restored
        };
        tracing::info!(active, recording_sets = restored_sets, "replay state restored");
        self.publish_snapshot();
        active
    }

    /// Attaches to every open tab whose URL replay can serve. Returns the number of newly
    /// attached tabs.
    pub async fn attach_replayable_tabs(&self) -> usize {
        let tabs = match self.browser().list_tabs().await {
            Ok(tabs) => tabs,
            Err(err) => {
                tracing::warn!("list tabs to attach replay: {err}");
                return 0;
            }
        };

        let mut attached = 0;
        for tab in tabs {
            let replayable = tab
                .url
                .as_deref()
                .is_some_and(|url| self.state().navigation.is_replayable_url(url));
            if !replayable {
                continue;
            }
            match self.sessions.attach(tab.id).await {
                Ok(AttachOutcome::Attached) => attached += 1,
                Ok(AttachOutcome::AlreadyAttached | AttachOutcome::Superseded) => {}
                Err(err) => tracing::warn!(tab_id = %tab.id, "{err}"),
            }
        }
        self.publish_snapshot();
        attached
    }

    /// Turns replay on globally and attaches to every open tab that can be debugged.
    /// Returns the number of newly attached tabs.
    pub async fn enable_replay(&self) -> usize {
        self.state().active = true;
        tracing::info!("replay enabled");
        self.persist(BTreeMap::from([(ACTIVE_KEY.to_owned(), Value::Bool(true))]))
            .await;
        self.publish_snapshot();
        self.attach_replayable_tabs().await
    }

    /// Turns replay off, drops every per-tab opt-in and releases every session.
    pub async fn disable_replay(&self) -> usize {
        {
            let mut state = self.state();
            state.active = false;
            state.opted_in.clear();
        }
        tracing::info!("replay disabled");
        self.persist(BTreeMap::from([(ACTIVE_KEY.to_owned(), Value::Bool(false))]))
            .await;
        let detached = self.sessions.detach_all().await;
        self.publish_snapshot();
        detached
    }

    pub async fn enable_tab(&self, tab: TabId) -> Result<(), ControlError> {
        let url = self
            .browser()
            .get_tab_url(tab)
            .await
            .map_err(ControlError::Browser)?;
        let replayable = url
            .as_deref()
            .is_some_and(|url| self.state().navigation.is_replayable_url(url));
        if !replayable {
            return Err(ControlError::TabNotReplayable { tab, url });
        }

        self.state().opted_in.insert(tab);
        let result = self.sessions.attach(tab).await;
        if result.is_err() {
            self.state().opted_in.remove(&tab);
        }
        self.publish_snapshot();
        result.map(drop).map_err(ControlError::Attach)
    }

    /// Opts a tab out. Its session is kept while replay is globally active.
    pub async fn disable_tab(&self, tab: TabId) -> DetachOutcome {
        let globally_active = {
            let mut state = self.state();
            state.opted_in.remove(&tab);
            state.active
        };
        let outcome = if globally_active {
            DetachOutcome::NotAttached
        } else {
            self.sessions.detach(tab).await
        };
        self.publish_snapshot();
        outcome
    }

    pub async fn load_recording_set(
        &self,
        name: impl Into<String>,
        document: Value,
    ) -> Result<LoadReport, ControlError> {
        let name = name.into();
        let Some(entries) = har::har_entries(&document) else {
            return Err(ControlError::InvalidHar { name });
        };

        let (report, sets) = {
            let mut state = self.state();
            let report = state
                .index
                .load(RecordingSetId::generate(), name, entries);
            (report, state.index.recording_sets())
        };
        tracing::info!(
            set_id = %report.set.id,
            name = %report.set.name,
            loaded = report.loaded(),
            skipped = report.skipped.len(),
            "recording set loaded"
        );

        self.persist(BTreeMap::from([
            (set_key(&report.set.id), document),
            (SETS_KEY.to_owned(), stored_sets(&sets)),
        ]))
        .await;
        self.publish_snapshot();
        Ok(report)
    }

    pub async fn unload_recording_set(&self, id: &RecordingSetId) -> Result<(), ControlError> {
        let sets = {
            let mut state = self.state();
            if !state.index.unload(id) {
                return Err(ControlError::UnknownRecordingSet(id.clone()));
            }
            state.index.recording_sets()
        };
        tracing::info!(set_id = %id, "recording set unloaded");

        self.persist(BTreeMap::from([(SETS_KEY.to_owned(), stored_sets(&sets))]))
            .await;
        if let Some(store) = self.store.as_ref() {
            if let Err(err) = store.remove(vec![set_key(id)]).await {
                tracing::warn!(set_id = %id, "remove stored recording set: {err:#}");
            }
        }
        self.publish_snapshot();
        Ok(())
    }

    pub async fn handle_command(&self, command: ControlCommand) -> Result<Value, ControlError> {
        match command {
            ControlCommand::EnableReplay => {
                let attached = self.enable_replay().await;
                Ok(json!({ "active": true, "attachedTabs": attached }))
            }
            ControlCommand::DisableReplay => {
                let detached = self.disable_replay().await;
                Ok(json!({ "active": false, "detachedTabs": detached }))
            }
            ControlCommand::EnableTab { tab_id } => {
                self.enable_tab(tab_id).await?;
                Ok(json!({ "tabId": tab_id, "active": true }))
            }
            ControlCommand::DisableTab { tab_id } => {
                self.disable_tab(tab_id).await;
                Ok(json!({ "tabId": tab_id, "active": self.is_active() }))
            }
            ControlCommand::LoadRecordingSet { name, har } => {
                let report = self.load_recording_set(name, har).await?;
                Ok(load_report_json(&report))
            }
            ControlCommand::UnloadRecordingSet { id } => {
                self.unload_recording_set(&id).await?;
                Ok(json!({ "removed": id }))
            }
            ControlCommand::GetSnapshot => Ok(json!(self.snapshot())),
            ControlCommand::ListEndpoints => Ok(json!(self.list_endpoints())),
        }
    }

    /// Applies a browser event and spawns the browser commands it calls for.
    pub fn dispatch(self: &Arc<Self>, event: BrowserEvent) -> JoinHandle<()> {
        match event {
            BrowserEvent::BeforeNavigate {
                tab_id,
                frame_id,
                url,
            } => {
                let effects = {
                    let mut state = self.state();
                    let active = state.replay_active_for(tab_id);
                    state
                        .navigation
                        .on_before_navigate(tab_id, frame_id, &url, active)
                };
                self.spawn_effects(effects)
            }
            BrowserEvent::NavigationCompleted {
                tab_id,
                frame_id,
                url,
            } => {
                let effects = self
                    .state()
                    .navigation
                    .on_navigation_completed(tab_id, frame_id, &url);
                self.spawn_effects(effects)
            }
            BrowserEvent::TabClosed { tab_id } => {
                let effects = {
                    let mut state = self.state();
                    state.opted_in.remove(&tab_id);
                    state.navigation.on_tab_closed(tab_id)
                };
                self.spawn_effects(effects)
            }
            BrowserEvent::DebuggerDetached { tab_id, reason } => {
                let forgotten = self.sessions.forget(tab_id);
                self.state().opted_in.remove(&tab_id);
                tracing::info!(
                    tab_id = %tab_id,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    forgotten,
                    "browser ended interception session"
                );
                self.publish_snapshot();
                self.spawn_effects(Vec::new())
            }
            BrowserEvent::RequestPaused {
                tab_id,
                request_id,
                request,
            } => {
                let (action, advanced) = {
                    let mut state = self.state();
                    if state.replay_active_for(tab_id) {
                        let action = fulfillment::handle(&mut state.index, &request);
                        let advanced = match &action {
                            Action::Fulfill(fulfillment) => {
                                state.index.endpoint_summary(&fulfillment.endpoint)
                            }
                            Action::PassThrough => None,
                        };
                        (action, advanced)
                    } else {
                        (Action::PassThrough, None)
                    }
                };

                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.answer(tab_id, request_id, action).await;
                    if let Some(summary) = advanced {
                        let _ = this.events.send(ControlEvent::EndpointAdvanced(summary));
                    }
                })
            }
        }
    }

    /// Answers a paused request at most once. A fulfillment that provably did not reach the
    /// browser falls back to releasing the request.
    async fn answer(&self, tab: TabId, request_id: PausedRequestId, action: Action) {
        match action {
            Action::Fulfill(fulfillment) => {
                match self.browser().fulfill(tab, request_id, &fulfillment).await {
                    Ok(()) => tracing::debug!(
                        tab_id = %tab,
                        method = %fulfillment.endpoint.method,
                        path = %fulfillment.endpoint.path,
                        status = fulfillment.status,
                        "request fulfilled from recording"
                    ),
                    Err(FulfillError::Unanswered(Unanswered { request_id, error })) => {
                        tracing::warn!(
                            tab_id = %tab,
                            request_id = request_id.as_str(),
                            path = %fulfillment.endpoint.path,
                            "fulfill failed, passing request through: {error}"
                        );
                        self.release(tab, request_id).await;
                    }
                    Err(FulfillError::Indeterminate(error)) => tracing::warn!(
                        tab_id = %tab,
                        path = %fulfillment.endpoint.path,
                        "fulfill may have been applied, not answering the request again: {error}"
                    ),
                }
            }
            Action::PassThrough => self.release(tab, request_id).await,
        }
    }

    async fn release(&self, tab: TabId, request_id: PausedRequestId) {
        let id = request_id.as_str().to_owned();
        if let Err(err) = self.browser().continue_request(tab, request_id).await {
            tracing::warn!(tab_id = %tab, request_id = %id, "continue request: {err}");
        }
    }

    fn spawn_effects(self: &Arc<Self>, effects: Vec<NavEffect>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_effects(effects))
    }

    fn run_effects(
        self: Arc<Self>,
        effects: Vec<NavEffect>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut queue = VecDeque::from(effects);
            while let Some(effect) = queue.pop_front() {
                match effect {
                    NavEffect::Redirect { tab, url } => {
                        if let Err(err) = self.browser().navigate_tab(tab, &url).await {
                            tracing::warn!(tab_id = %tab, url = %url, "redirect failed: {err}");
                            self.state().navigation.on_redirect_failed(tab, &url);
                        }
                    }
                    NavEffect::Attach { tab } => match self.sessions.attach(tab).await {
                        Ok(_) => self.publish_snapshot(),
                        Err(err) => {
                            tracing::warn!(tab_id = %tab, "{err}");
                            let restore = self.state().navigation.on_attach_failed(tab);
                            queue.extend(restore);
                        }
                    },
                    NavEffect::Detach { tab } => {
                        self.sessions.detach(tab).await;
                        self.publish_snapshot();
                    }
                    NavEffect::StartDetourTimer { tab, detour, after } => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            tokio::time::sleep(after).await;
                            let effects = this.state().navigation.on_detour_timeout(tab, detour);
                            if !effects.is_empty() {
                                this.run_effects(effects).await;
                            }
                        });
                    }
                }
            }
        })
    }

    async fn persist(&self, entries: BTreeMap<String, Value>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(err) = store.set(entries).await {
            tracing::warn!("persist replay state: {err:#}");
        }
    }
}

pub fn load_report_json(report: &LoadReport) -> Value {
    let skipped: Vec<Value> = report
        .skipped
        .iter()
        .map(|entry| {
            json!({
                "index": entry.index,
                "kind": entry.reason.kind(),
                "reason": entry.reason.to_string(),
            })
        })
        .collect();
    json!({
        "set": report.set,
        "loaded": report.loaded(),
        "skipped": skipped,
    })
}

fn set_key(id: &RecordingSetId) -> String {
    format!("{SET_KEY_PREFIX}{id}")
}

fn stored_sets(sets: &[RecordingSetInfo]) -> Value {
    json!(sets)
}

async fn load_persisted(store: &KeyValueStore) -> anyhow::Result<PersistedState> {
    let values = store
        .get(vec![ACTIVE_KEY.to_owned(), SETS_KEY.to_owned()])
        .await?;
    let active = values.get(ACTIVE_KEY).and_then(Value::as_bool);
    let listed: Vec<StoredSet> = match values.get(SETS_KEY) {
        Some(sets) => serde_json::from_value(sets.clone()).context("decode stored set list")?,
        None => Vec::new(),
    };

    let mut documents = store
        .get(listed.iter().map(|set| set_key(&set.id)).collect())
        .await?;
    let sets = listed
        .into_iter()
        .filter_map(|set| match documents.remove(&set_key(&set.id)) {
            Some(document) => Some(PersistedSet {
                id: set.id,
                name: set.name,
                document,
            }),
            None => {
                tracing::warn!(set_id = %set.id, "stored recording set has no HAR document");
                None
            }
        })
        .collect();

    Ok(PersistedState { active, sets })
}
