//! Online-presence registry.
//!
//! Keyed by account id; tracks which char-server (if any) currently owns
//! a login, as an explicit table owned by [`super::LoginEngine`] instead
//! of a global.

use std::collections::HashMap;

/// No char-server owns this entry.
pub const CHAR_NONE: i32 = -1;
/// The owning char-server disconnected without a clean logout.
pub const CHAR_ORPHANED: i32 = -2;
/// Administrative sentinel account id: clears the whole registry.
pub const PURGE_ACCOUNT_ID: u32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineEntry {
    pub char_server_id: i32,
    pub waiting_disconnect: bool,
}

/// Per-account online table. `online_check` gates every mutating method
/// except [`cleanup_stale`] and [`purge_all`], which always run.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    online_check: bool,
    entries: HashMap<u32, OnlineEntry>,
}

impl PresenceRegistry {
    pub fn new(online_check: bool) -> Self {
        PresenceRegistry { online_check, entries: HashMap::new() }
    }

    pub fn owner_of(&self, account_id: u32) -> Option<i32> {
        self.entries.get(&account_id).map(|e| e.char_server_id)
    }

    pub fn is_online(&self, account_id: u32) -> bool {
        self.entries.contains_key(&account_id)
    }

    pub fn mark_online(&mut self, account_id: u32, char_server_id: i32) {
        if !self.online_check {
            return;
        }
        self.entries.insert(
            account_id,
            OnlineEntry { char_server_id, waiting_disconnect: false },
        );
    }

    pub fn mark_offline(&mut self, account_id: u32) {
        if !self.online_check {
            return;
        }
        self.entries.remove(&account_id);
    }

    /// Rewrites every entry owned by `char_server_id` to [`CHAR_ORPHANED`].
    pub fn mark_all_offline_from(&mut self, char_server_id: i32) {
        if !self.online_check {
            return;
        }
        for entry in self.entries.values_mut() {
            if entry.char_server_id == char_server_id {
                entry.char_server_id = CHAR_ORPHANED;
            }
        }
    }

    /// Orphans everything owned by `char_server_id`, then reinstates the
    /// given account ids as owned by it: a bulk presence resync.
    pub fn snapshot_for_char_server(&mut self, char_server_id: i32, account_ids: &[u32]) {
        if !self.online_check {
            return;
        }
        self.mark_all_offline_from_unconditional(char_server_id);
        for &id in account_ids {
            self.entries.insert(
                id,
                OnlineEntry { char_server_id, waiting_disconnect: false },
            );
        }
    }

    fn mark_all_offline_from_unconditional(&mut self, char_server_id: i32) {
        for entry in self.entries.values_mut() {
            if entry.char_server_id == char_server_id {
                entry.char_server_id = CHAR_ORPHANED;
            }
        }
    }

    pub fn set_waiting_disconnect(&mut self, account_id: u32, waiting: bool) {
        if let Some(entry) = self.entries.get_mut(&account_id) {
            entry.waiting_disconnect = waiting;
        }
    }

    /// Removes orphaned entries unconditionally; runs regardless of
    /// `online_check`.
    pub fn cleanup_stale(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.char_server_id != CHAR_ORPHANED);
        before - self.entries.len()
    }

    /// Clears the whole registry (the account id 99 administrative purge),
    /// bypassing `online_check`.
    pub fn purge_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_online_then_offline_leaves_no_entry() {
        let mut reg = PresenceRegistry::new(true);
        reg.mark_online(100, 0);
        assert_eq!(reg.owner_of(100), Some(0));
        reg.mark_offline(100);
        assert_eq!(reg.owner_of(100), None);
    }

    #[test]
    fn disabled_online_check_is_a_no_op() {
        let mut reg = PresenceRegistry::new(false);
        reg.mark_online(100, 0);
        assert_eq!(reg.owner_of(100), None);
    }

    #[test]
    fn mark_all_offline_from_is_idempotent() {
        let mut reg = PresenceRegistry::new(true);
        reg.mark_online(1, 5);
        reg.mark_online(2, 5);
        reg.mark_online(3, 9);
        reg.mark_all_offline_from(5);
        assert_eq!(reg.owner_of(1), Some(CHAR_ORPHANED));
        assert_eq!(reg.owner_of(2), Some(CHAR_ORPHANED));
        assert_eq!(reg.owner_of(3), Some(9));
        reg.mark_all_offline_from(5);
        assert_eq!(reg.owner_of(1), Some(CHAR_ORPHANED));
    }

    #[test]
    fn cleanup_stale_removes_orphans_even_when_online_check_disabled() {
        let mut reg = PresenceRegistry::new(true);
        reg.mark_online(1, 5);
        reg.mark_all_offline_from(5);
        // flip the gate off after the fact; cleanup must still work
        reg.online_check = false;
        let removed = reg.cleanup_stale();
        assert_eq!(removed, 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_for_char_server_reinstates_listed_accounts() {
        let mut reg = PresenceRegistry::new(true);
        reg.mark_online(1, 5);
        reg.mark_online(2, 5);
        reg.snapshot_for_char_server(5, &[1]);
        assert_eq!(reg.owner_of(1), Some(5));
        assert_eq!(reg.owner_of(2), Some(CHAR_ORPHANED));
    }

    #[test]
    fn purge_all_clears_registry_regardless_of_online_check() {
        let mut reg = PresenceRegistry::new(false);
        reg.entries.insert(PURGE_ACCOUNT_ID, OnlineEntry { char_server_id: 0, waiting_disconnect: false });
        reg.purge_all();
        assert!(reg.is_empty());
    }
}
