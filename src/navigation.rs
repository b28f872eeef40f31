//! Navigation redirection.
//!
//! Interception only observes requests issued after the capability is attached, so a top
//! level navigation would make its first request unobserved. The redirector detours such a
//! navigation through a neutral page, requests an attach meanwhile, and sends the tab back
//! to the original URL once the neutral page has loaded. A per-tab guard keeps the return
//! hop from being detoured again.
//!
//! The redirector is a plain state machine: every handler takes an event and returns the
//! effects the caller must carry out.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::interception::{CapabilityError, TabId};

pub const TOP_LEVEL_FRAME: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    #[serde(default)]
    pub url: Option<String>,
}

/// Tab lifecycle and navigation commands offered by the browser.
#[async_trait]
pub trait TabControl: Send + Sync {
    async fn navigate_tab(&self, tab: TabId, url: &str) -> Result<(), CapabilityError>;

    async fn get_tab_url(&self, tab: TabId) -> Result<Option<String>, CapabilityError>;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, CapabilityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetourId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavEffect {
    Redirect { tab: TabId, url: String },
    Attach { tab: TabId },
    Detach { tab: TabId },
    StartDetourTimer {
        tab: TabId,
        detour: DetourId,
        after: Duration,
    },
}

#[derive(Debug, Clone)]
struct Detour {
    id: DetourId,
    original_url: String,
}

#[derive(Debug, Clone, Default)]
struct TabNavigation {
    detour: Option<Detour>,
    /// Set while the tab is bouncing back from the neutral page to its original URL.
    guard: bool,
}

impl TabNavigation {
    fn is_idle(&self) -> bool {
        self.detour.is_none() && !self.guard
    }
}

#[derive(Debug)]
pub struct NavigationRedirector {
    neutral_page_url: String,
    ignored_url_prefixes: Vec<String>,
    detour_timeout: Option<Duration>,
    tabs: HashMap<TabId, TabNavigation>,
    next_detour: u64,
}

impl NavigationRedirector {
    pub fn new(
        neutral_page_url: impl Into<String>,
        ignored_url_prefixes: Vec<String>,
        detour_timeout: Option<Duration>,
    ) -> Self {
        Self {
            neutral_page_url: neutral_page_url.into(),
            ignored_url_prefixes,
            detour_timeout,
            tabs: HashMap::new(),
            next_detour: 0,
        }
    }

    pub fn neutral_page_url(&self) -> &str {
        &self.neutral_page_url
    }

    /// Browser-internal and extension pages cannot be debugged.
    pub fn is_replayable_url(&self, url: &str) -> bool {
        !url.is_empty()
            && !self
                .ignored_url_prefixes
                .iter()
                .any(|prefix| url.starts_with(prefix.as_str()))
    }

    pub fn pending_detour(&self, tab: TabId) -> Option<&str> {
        self.tabs
            .get(&tab)?
            .detour
            .as_ref()
            .map(|detour| detour.original_url.as_str())
    }

    pub fn guard_set(&self, tab: TabId) -> bool {
        self.tabs.get(&tab).is_some_and(|state| state.guard)
    }

    pub fn has_state(&self, tab: TabId) -> bool {
        self.tabs.contains_key(&tab)
    }

    pub fn on_before_navigate(
        &mut self,
        tab: TabId,
        frame_id: i64,
        url: &str,
        replay_active: bool,
    ) -> Vec<NavEffect> {
        if self.guard_set(tab) {
            tracing::debug!(tab_id = %tab, url, "ignoring return hop navigation");
            return Vec::new();
        }
        if frame_id != TOP_LEVEL_FRAME
            || !replay_active
            || !self.is_replayable_url(url)
            || url == self.neutral_page_url
        {
            return Vec::new();
        }
        if self.pending_detour(tab).is_some() {
            tracing::debug!(tab_id = %tab, url, "detour already outstanding, ignoring navigation");
            return Vec::new();
        }

        self.next_detour += 1;
        let id = DetourId(self.next_detour);
        self.tabs.entry(tab).or_default().detour = Some(Detour {
            id,
            original_url: url.to_owned(),
        });
        tracing::debug!(tab_id = %tab, url, "detouring navigation through neutral page");

        let mut effects = vec![
            NavEffect::Redirect {
                tab,
                url: self.neutral_page_url.clone(),
            },
            NavEffect::Attach { tab },
        ];
        if let Some(after) = self.detour_timeout {
            effects.push(NavEffect::StartDetourTimer {
                tab,
                detour: id,
                after,
            });
        }
        effects
    }

    /// Handles a finished top-level navigation. On the neutral page this takes the return
    /// hop; anywhere else it ends a return hop that was in progress.
    pub fn on_navigation_completed(&mut self, tab: TabId, frame_id: i64, url: &str) -> Vec<NavEffect> {
        if frame_id != TOP_LEVEL_FRAME {
            return Vec::new();
        }

        if url == self.neutral_page_url {
            return self.return_to_original(tab).into_iter().collect();
        }

        let return_hop_done = match self.tabs.get_mut(&tab) {
            Some(state) if state.guard => {
                state.guard = false;
                true
            }
            _ => false,
        };
        if return_hop_done {
            tracing::debug!(tab_id = %tab, url, "return hop completed");
            self.prune(tab);
        }
        Vec::new()
    }

    /// Restores the original navigation when the attach requested for a detour failed.
    pub fn on_attach_failed(&mut self, tab: TabId) -> Vec<NavEffect> {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return Vec::new();
        };
        let Some(detour) = state.detour.take() else {
            // The return hop is already on its way; its completion clears the guard.
            return Vec::new();
        };
        state.guard = false;
        self.prune(tab);
        tracing::warn!(
            tab_id = %tab,
            url = %detour.original_url,
            "attach failed during detour, restoring original navigation"
        );
        vec![NavEffect::Redirect {
            tab,
            url: detour.original_url,
        }]
    }

    /// Handles a `Redirect` the browser refused. A failed hop to the neutral page drops
    /// the detour, since no neutral-page completion will ever consume it. A failed return
    /// hop releases the guard. The tab stays where it is in both cases.
    pub fn on_redirect_failed(&mut self, tab: TabId, url: &str) {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return;
        };
        if url == self.neutral_page_url {
            if let Some(detour) = state.detour.take() {
                tracing::warn!(
                    tab_id = %tab,
                    url = %detour.original_url,
                    "neutral page redirect failed, dropping detour"
                );
            }
        } else if state.guard {
            state.guard = false;
            tracing::warn!(tab_id = %tab, url, "return hop redirect failed");
        }
        self.prune(tab);
    }

    /// Forces the return hop for a detour whose neutral page never finished loading.
    pub fn on_detour_timeout(&mut self, tab: TabId, detour: DetourId) -> Vec<NavEffect> {
        let still_pending = self
            .tabs
            .get(&tab)
            .and_then(|state| state.detour.as_ref())
            .is_some_and(|pending| pending.id == detour);
        if !still_pending {
            return Vec::new();
        }
        tracing::warn!(tab_id = %tab, "detour timed out, returning to original url without waiting");
        self.return_to_original(tab).into_iter().collect()
    }

    pub fn on_tab_closed(&mut self, tab: TabId) -> Vec<NavEffect> {
        self.tabs.remove(&tab);
        vec![NavEffect::Detach { tab }]
    }

    fn return_to_original(&mut self, tab: TabId) -> Option<NavEffect> {
        let state = self.tabs.get_mut(&tab)?;
        let detour = state.detour.take()?;
        state.guard = true;
        Some(NavEffect::Redirect {
            tab,
            url: detour.original_url,
        })
    }

    fn prune(&mut self, tab: TabId) {
        if self.tabs.get(&tab).is_some_and(TabNavigation::is_idle) {
            self.tabs.remove(&tab);
        }
    }
}
