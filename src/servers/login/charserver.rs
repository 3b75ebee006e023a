//! The connected char-server table: one entry per promoted link, plus
//! fan-out broadcast with originator suppression.

use std::net::Ipv4Addr;
use tokio::sync::mpsc;

/// Fixed slot count for connected char-servers.
pub const MAX_SERVERS: usize = 30;

pub struct CharServerEntry {
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub user_count: u16,
    pub maintenance: bool,
    pub is_new: bool,
    pub tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
pub struct CharServerTable {
    slots: Vec<Option<CharServerEntry>>,
}

impl CharServerTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_SERVERS);
        slots.resize_with(MAX_SERVERS, || None);
        CharServerTable { slots }
    }

    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    pub fn insert(&mut self, slot: usize, entry: CharServerEntry) {
        self.slots[slot] = Some(entry);
    }

    pub fn remove(&mut self, slot: usize) -> Option<CharServerEntry> {
        self.slots.get_mut(slot).and_then(|s| s.take())
    }

    pub fn get(&self, slot: usize) -> Option<&CharServerEntry> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut CharServerEntry> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &CharServerEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|e| (i, e)))
    }

    pub fn connected_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Fans `bytes` out to every connected char-server except `except_slot`.
    /// Best-effort: a full or closed outbound channel is silently skipped.
    pub async fn broadcast_except(&self, except_slot: Option<usize>, bytes: Vec<u8>) {
        for (slot, entry) in self.iter() {
            if Some(slot) == except_slot {
                continue;
            }
            let _ = entry.tx.send(bytes.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> (CharServerEntry, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        (
            CharServerEntry {
                name: name.to_string(),
                ip: "10.0.0.1".parse().unwrap(),
                port: 6121,
                user_count: 0,
                maintenance: false,
                is_new: false,
                tx,
            },
            rx,
        )
    }

    #[test]
    fn free_slot_assignment_fills_lowest_first() {
        let mut table = CharServerTable::new();
        let (e0, _r0) = entry("s0");
        table.insert(table.find_free_slot().unwrap(), e0);
        assert_eq!(table.find_free_slot(), Some(1));
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut table = CharServerTable::new();
        let (e0, _r0) = entry("s0");
        let slot = table.find_free_slot().unwrap();
        table.insert(slot, e0);
        assert!(table.remove(slot).is_some());
        assert_eq!(table.find_free_slot(), Some(0));
    }

    #[tokio::test]
    async fn broadcast_excludes_originator() {
        let mut table = CharServerTable::new();
        let (e0, mut r0) = entry("s0");
        let (e1, mut r1) = entry("s1");
        table.insert(0, e0);
        table.insert(1, e1);

        table.broadcast_except(Some(0), vec![1, 2, 3]).await;
        assert!(r0.try_recv().is_err());
        assert_eq!(r1.try_recv().unwrap(), vec![1, 2, 3]);
    }
}
