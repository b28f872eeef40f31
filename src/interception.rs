use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fulfillment::Fulfillment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one paused request. Neither `Clone` nor `Copy`: answering a
/// request consumes it, so a request cannot be answered twice.
#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PausedRequestId(String);

impl PausedRequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityError {
    message: String,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CapabilityError {}

/// A fulfillment that did not reach the browser. Hands the request id back so the caller
/// can still release the request.
#[derive(Debug)]
pub struct Unanswered {
    pub request_id: PausedRequestId,
    pub error: CapabilityError,
}

#[derive(Debug)]
pub enum FulfillError {
    /// The request is still paused and must be answered another way.
    Unanswered(Unanswered),
    /// The fulfillment may have been applied. The request id is gone with it.
    Indeterminate(CapabilityError),
}

impl fmt::Display for FulfillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unanswered(unanswered) => write!(f, "{}", unanswered.error),
            Self::Indeterminate(err) => write!(f, "fulfillment outcome unknown: {err}"),
        }
    }
}

impl std::error::Error for FulfillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unanswered(unanswered) => Some(&unanswered.error),
            Self::Indeterminate(err) => Some(err),
        }
    }
}

/// Low-level request interception for one tab (a debugger attachment in the browser).
#[async_trait]
pub trait InterceptionCapability: Send + Sync {
    async fn attach(&self, tab: TabId) -> Result<(), CapabilityError>;

    async fn enable_pause(&self, tab: TabId, patterns: &[String]) -> Result<(), CapabilityError>;

    async fn detach(&self, tab: TabId) -> Result<(), CapabilityError>;

    async fn fulfill(
        &self,
        tab: TabId,
        request_id: PausedRequestId,
        fulfillment: &Fulfillment,
    ) -> Result<(), FulfillError>;

    async fn continue_request(
        &self,
        tab: TabId,
        request_id: PausedRequestId,
    ) -> Result<(), CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Detached,
    Attaching,
    Attached,
    Detaching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
    /// The tab was detached or closed while the attach was in flight.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStage {
    Attach,
    EnablePause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachError {
    pub tab: TabId,
    pub stage: AttachStage,
    pub source: CapabilityError,
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            AttachStage::Attach => write!(f, "attach to tab {}: {}", self.tab, self.source),
            AttachStage::EnablePause => write!(
                f,
                "enable request pausing on tab {}: {}",
                self.tab, self.source
            ),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    Detached,
    NotAttached,
    /// An attach was still in flight; it releases the capability when it completes.
    CancelledAttach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Attaching { attempt: u64 },
    Attached,
    Detaching,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<TabId, SessionState>,
    next_attempt: u64,
}

/// Per-tab interception sessions.
///
/// The table lock is only held for synchronous checks and writes, never across a capability
/// call; each completion re-checks the table before mutating it.
pub struct InterceptionSessions<C: ?Sized> {
    capability: Arc<C>,
    patterns: Vec<String>,
    table: Mutex<SessionTable>,
}

impl<C: InterceptionCapability + ?Sized> InterceptionSessions<C> {
    pub fn new(capability: Arc<C>, patterns: Vec<String>) -> Self {
        Self {
            capability,
            patterns,
            table: Mutex::new(SessionTable::default()),
        }
    }

    pub fn capability(&self) -> &Arc<C> {
        &self.capability
    }

    fn table(&self) -> std::sync::MutexGuard<'_, SessionTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self, tab: TabId) -> SessionStatus {
        match self.table().sessions.get(&tab) {
            None => SessionStatus::Detached,
            Some(SessionState::Attaching { .. }) => SessionStatus::Attaching,
            Some(SessionState::Attached) => SessionStatus::Attached,
            Some(SessionState::Detaching) => SessionStatus::Detaching,
        }
    }

    pub fn attached_tabs(&self) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self
            .table()
            .sessions
            .iter()
            .filter(|(_, state)| matches!(state, SessionState::Attached))
            .map(|(tab, _)| *tab)
            .collect();
        tabs.sort();
        tabs
    }

    pub async fn attach(&self, tab: TabId) -> Result<AttachOutcome, AttachError> {
        let attempt = {
            let mut table = self.table();
            match table.sessions.get(&tab) {
                Some(SessionState::Attached | SessionState::Attaching { .. }) => {
                    return Ok(AttachOutcome::AlreadyAttached);
                }
                Some(SessionState::Detaching) | None => {}
            }
            table.next_attempt += 1;
            let attempt = table.next_attempt;
            table
                .sessions
                .insert(tab, SessionState::Attaching { attempt });
            attempt
        };

        if let Err(source) = self.capability.attach(tab).await {
            self.abandon_attempt(tab, attempt);
            return Err(AttachError {
                tab,
                stage: AttachStage::Attach,
                source,
            });
        }

        if let Err(source) = self.capability.enable_pause(tab, &self.patterns).await {
            if let Err(err) = self.capability.detach(tab).await {
                tracing::debug!(tab_id = %tab, "release after failed pause setup: {err}");
            }
            self.abandon_attempt(tab, attempt);
            return Err(AttachError {
                tab,
                stage: AttachStage::EnablePause,
                source,
            });
        }

        let release = {
            let mut table = self.table();
            match table.sessions.get(&tab).copied() {
                Some(SessionState::Attaching { attempt: current }) if current == attempt => {
                    table.sessions.insert(tab, SessionState::Attached);
                    tracing::info!(tab_id = %tab, "interception session attached");
                    return Ok(AttachOutcome::Attached);
                }
                None => true,
                Some(_) => false,
            }
        };

        if release {
            tracing::debug!(tab_id = %tab, "attach completed after detach was requested");
            if let Err(err) = self.capability.detach(tab).await {
                tracing::debug!(tab_id = %tab, "release superseded attach: {err}");
            }
        }
        Ok(AttachOutcome::Superseded)
    }

    fn abandon_attempt(&self, tab: TabId, attempt: u64) {
        let mut table = self.table();
        if table.sessions.get(&tab) == Some(&SessionState::Attaching { attempt }) {
            table.sessions.remove(&tab);
        }
    }

    /// Releases a tab's session. The session is gone afterwards even when the release
    /// itself fails.
    pub async fn detach(&self, tab: TabId) -> DetachOutcome {
        {
            let mut table = self.table();
            match table.sessions.get(&tab) {
                None | Some(SessionState::Detaching) => return DetachOutcome::NotAttached,
                Some(SessionState::Attaching { .. }) => {
                    table.sessions.remove(&tab);
                    return DetachOutcome::CancelledAttach;
                }
                Some(SessionState::Attached) => {
                    table.sessions.insert(tab, SessionState::Detaching);
                }
            }
        }

        if let Err(err) = self.capability.detach(tab).await {
            tracing::warn!(tab_id = %tab, "detach failed, dropping session anyway: {err}");
        }

        let mut table = self.table();
        if table.sessions.get(&tab) == Some(&SessionState::Detaching) {
            table.sessions.remove(&tab);
        }
        tracing::info!(tab_id = %tab, "interception session detached");
        DetachOutcome::Detached
    }

    pub async fn detach_all(&self) -> usize {
        let tabs: Vec<TabId> = self.table().sessions.keys().copied().collect();
        let mut detached = 0;
        for tab in tabs {
            if self.detach(tab).await != DetachOutcome::NotAttached {
                detached += 1;
            }
        }
        detached
    }

    /// Drops a session the browser already ended on its own (tab crashed, user dismissed the
    /// debugging banner). No release command is sent.
    pub fn forget(&self, tab: TabId) -> bool {
        self.table().sessions.remove(&tab).is_some()
    }
}
