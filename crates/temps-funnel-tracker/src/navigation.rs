//! URL change detection
//!
//! [`History`] plays the role of the browser history API: `push_state` and
//! `replace_state` change the URL without a page load, `back`/`forward`/`go`
//! are pop navigations. The tracker only sees it through [`NavigationSource`],
//! so tests can feed synthetic navigations.

use parking_lot::Mutex;
use url::Url;

use crate::listeners::{Listener, ListenerId, Listeners};

const PLACEHOLDER_ORIGIN: &str = "http://localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    Push,
    Replace,
    Pop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationChange {
    pub url: String,
    pub kind: NavigationKind,
}

pub trait NavigationSource: Send + Sync {
    fn subscribe(&self, listener: Listener<NavigationChange>) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;

    fn current_url(&self) -> String;
}

#[derive(Debug)]
struct HistoryEntries {
    entries: Vec<String>,
    index: usize,
}

pub struct History {
    state: Mutex<HistoryEntries>,
    listeners: Listeners<NavigationChange>,
}

impl History {
    pub fn new(initial_url: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(HistoryEntries {
                entries: vec![initial_url.into()],
                index: 0,
            }),
            listeners: Listeners::new(),
        }
    }

    /// New entry after the current one, dropping any forward entries
    pub fn push_state(&self, url: impl Into<String>) {
        let url = url.into();
        {
            let mut state = self.state.lock();
            let keep = state.index + 1;
            state.entries.truncate(keep);
            state.entries.push(url.clone());
            state.index = keep;
        }
        self.notify(url, NavigationKind::Push);
    }

    pub fn replace_state(&self, url: impl Into<String>) {
        let url = url.into();
        {
            let mut state = self.state.lock();
            let index = state.index;
            state.entries[index] = url.clone();
        }
        self.notify(url, NavigationKind::Replace);
    }

    pub fn back(&self) -> bool {
        self.go(-1)
    }

    pub fn forward(&self) -> bool {
        self.go(1)
    }

    /// Move `delta` entries; out-of-range moves are ignored.
    pub fn go(&self, delta: isize) -> bool {
        let url = {
            let mut state = self.state.lock();
            let target = state.index as isize + delta;
            if delta == 0 || target < 0 || target as usize >= state.entries.len() {
                return false;
            }
            state.index = target as usize;
            state.entries[state.index].clone()
        };
        self.notify(url, NavigationKind::Pop);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&self, url: String, kind: NavigationKind) {
        self.listeners.emit(&NavigationChange { url, kind });
    }
}

impl NavigationSource for History {
    fn subscribe(&self, listener: Listener<NavigationChange>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn current_url(&self) -> String {
        let state = self.state.lock();
        state.entries[state.index].clone()
    }
}

/// Path component of `url`; query and fragment are dropped.
pub fn normalize_path(url: &str) -> String {
    let base = Url::parse(PLACEHOLDER_ORIGIN).ok();
    let parsed = Url::options().base_url(base.as_ref()).parse(url);
    match parsed {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => {
            let end = url.find(|c: char| c == '?' || c == '#').unwrap_or(url.len());
            url[..end].to_string()
        }
    }
}

/// Remembers the last evaluated path and filters out no-op navigations
#[derive(Debug, Default)]
pub struct NavigationWatcher {
    last_path: Option<String>,
}

impl NavigationWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized path when it differs from the last one seen, else `None`.
    pub fn observe(&mut self, url: &str) -> Option<String> {
        let path = normalize_path(url);
        if self.last_path.as_deref() == Some(path.as_str()) {
            return None;
        }
        self.last_path = Some(path.clone());
        Some(path)
    }

    pub fn last_path(&self) -> Option<&str> {
        self.last_path.as_deref()
    }
}
