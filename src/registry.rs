//! Process-wide session arena.
//!
//! The transport's notification-delivery path cannot carry a reference to a
//! live session, only a small integer chosen when the connection was opened.
//! This module maps that integer back to the owning session. Entries are
//! weak so a dropped session can never be revived by a late callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::session::SessionShared;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static SESSIONS: OnceLock<Mutex<HashMap<u64, Weak<SessionShared>>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<u64, Weak<SessionShared>>> {
    SESSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn allocate_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn register(id: u64, session: Weak<SessionShared>) {
    if let Ok(mut sessions) = table().lock() {
        sessions.insert(id, session);
    }
}

pub(crate) fn unregister(id: u64) {
    if let Ok(mut sessions) = table().lock() {
        sessions.remove(&id);
    }
}

pub(crate) fn lookup(id: u64) -> Option<Arc<SessionShared>> {
    let sessions = table().lock().ok()?;
    sessions.get(&id)?.upgrade()
}

#[cfg(test)]
mod tests {
    use super::{allocate_id, lookup};

    #[test]
    fn ids_are_unique_and_increasing() {
        let first = allocate_id();
        let second = allocate_id();
        assert!(second > first);
    }

    #[test]
    fn lookup_of_unknown_id_is_none() {
        assert!(lookup(u64::MAX).is_none());
    }
}
