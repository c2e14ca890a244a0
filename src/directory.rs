use std::collections::BTreeMap;
use std::net::SocketAddr;
use rustc_hash::FxHashMap;

use crate::address::Address;
use crate::connection::{ConnectionRecord, PeerId};

/// The peers an engine knows, keyed by never-reused [PeerId] handles and looked up by
///  (wire address, virtual address).
#[derive(Debug, Default)]
pub struct ConnectionDirectory {
    records: BTreeMap<PeerId, ConnectionRecord>,
    by_address: FxHashMap<(SocketAddr, Address), PeerId>,
    next_id: u32,
}

impl ConnectionDirectory {
    pub fn new() -> ConnectionDirectory {
        ConnectionDirectory::default()
    }

    /// Adds a record, replacing (and returning) a previous record for the same addresses. The
    ///  replaced record's handle becomes invalid.
    pub fn add(&mut self, record: ConnectionRecord) -> (PeerId, Option<(PeerId, ConnectionRecord)>) {
        let key = (record.remote_address(), record.vaddr());
        let replaced = self.by_address.get(&key).copied()
            .and_then(|old_id| self.remove(old_id).map(|r| (old_id, r)));

        self.next_id += 1;
        let id = PeerId(self.next_id);
        self.by_address.insert(key, id);
        self.records.insert(id, record);
        (id, replaced)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<ConnectionRecord> {
        let record = self.records.remove(&id)?;
        self.by_address.remove(&(record.remote_address(), record.vaddr()));
        Some(record)
    }

    pub fn find(&self, remote_address: SocketAddr, vaddr: Address) -> Option<PeerId> {
        self.by_address.get(&(remote_address, vaddr)).copied()
    }

    pub fn get(&self, id: PeerId) -> Option<&ConnectionRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item=(PeerId, &ConnectionRecord)> {
        self.records.iter()
            .map(|(&id, r)| (id, r))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item=(PeerId, &mut ConnectionRecord)> {
        self.records.iter_mut()
            .map(|(&id, r)| (id, r))
    }

    pub fn direct_peers(&self) -> impl Iterator<Item=PeerId> + '_ {
        self.iter()
            .filter(|(_, r)| !r.is_indirect())
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_address.clear();
    }
}
