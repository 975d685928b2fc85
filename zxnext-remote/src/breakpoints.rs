//! Breakpoint, assertion, logpoint and watchpoint bookkeeping.
//!
//! Three collections feed the per-address index: user breakpoints, assert
//! breakpoints (only while asserts are enabled) and the enabled logpoint
//! groups. The index is a cache over those collections and is rebuilt from
//! scratch on entry of every resume, so group toggles between resumes can
//! never leave stale entries behind.

use std::collections::{HashMap, HashSet};

use dzrp_protocol::WatchAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    User,
    Assert,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Remote-assigned id; 0 means "not installed".
    pub id: u16,
    pub address: u16,
    /// Guard expression; for asserts this is the violation predicate.
    pub condition: Option<String>,
    /// Log format string; a satisfied entry with a log never pauses.
    pub log: Option<String>,
    pub kind: BreakpointKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    pub address: u16,
    pub size: u16,
    pub access: WatchAccess,
    pub condition: Option<String>,
}

impl Watchpoint {
    pub fn covers(&self, addr: u16, write: bool) -> bool {
        let in_range = addr.wrapping_sub(self.address) < self.size;
        let access_matches = match self.access {
            WatchAccess::Read => !write,
            WatchAccess::Write => write,
            WatchAccess::ReadWrite => true,
        };
        in_range && access_matches
    }
}

#[derive(Debug, Default)]
pub struct BreakpointTable {
    user: HashMap<u16, Breakpoint>,
    asserts: Vec<Breakpoint>,
    asserts_enabled: bool,
    logpoints: HashMap<String, Vec<Breakpoint>>,
    enabled_groups: HashSet<String>,
    watchpoints: Vec<Watchpoint>,
    index: HashMap<u16, Vec<Breakpoint>>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        BreakpointTable::default()
    }

    pub fn insert_user(&mut self, bp: Breakpoint) -> bool {
        if self.user.contains_key(&bp.id) {
            return false;
        }
        self.user.insert(bp.id, bp);
        true
    }

    pub fn remove_user(&mut self, id: u16) -> Option<Breakpoint> {
        self.user.remove(&id)
    }

    pub fn user_breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.user.values()
    }

    pub fn replace_asserts(&mut self, asserts: Vec<Breakpoint>) -> Vec<Breakpoint> {
        std::mem::replace(&mut self.asserts, asserts)
    }

    pub fn asserts(&self) -> &[Breakpoint] {
        &self.asserts
    }

    pub fn asserts_mut(&mut self) -> &mut [Breakpoint] {
        &mut self.asserts
    }

    pub fn asserts_enabled(&self) -> bool {
        self.asserts_enabled
    }

    pub fn set_asserts_enabled(&mut self, enabled: bool) {
        self.asserts_enabled = enabled;
    }

    pub fn replace_logpoints(&mut self, group: &str, points: Vec<Breakpoint>) -> Vec<Breakpoint> {
        self.logpoints.insert(group.to_string(), points).unwrap_or_default()
    }

    pub fn logpoint_group_mut(&mut self, group: &str) -> Option<&mut Vec<Breakpoint>> {
        self.logpoints.get_mut(group)
    }

    pub fn group_enabled(&self, group: &str) -> bool {
        self.enabled_groups.contains(group)
    }

    pub fn set_group_enabled(&mut self, group: &str, enabled: bool) {
        if enabled {
            self.enabled_groups.insert(group.to_string());
        } else {
            self.enabled_groups.remove(group);
        }
    }

    pub fn add_watchpoint(&mut self, wp: Watchpoint) {
        self.watchpoints.push(wp);
    }

    /// Watchpoints are keyed by (address, size) for removal.
    pub fn remove_watchpoint(&mut self, address: u16, size: u16) -> Option<Watchpoint> {
        let pos = self
            .watchpoints
            .iter()
            .position(|wp| wp.address == address && wp.size == size)?;
        Some(self.watchpoints.remove(pos))
    }

    pub fn watchpoints_covering(&self, addr: u16, write: bool) -> Vec<&Watchpoint> {
        self.watchpoints
            .iter()
            .filter(|wp| wp.covers(addr, write))
            .collect()
    }

    /// Rebuild the per-address index from the enabled collections.
    pub fn rebuild_index(&mut self) {
        self.index.clear();
        for bp in self.user.values() {
            self.index.entry(bp.address).or_default().push(bp.clone());
        }
        if self.asserts_enabled {
            for bp in &self.asserts {
                self.index.entry(bp.address).or_default().push(bp.clone());
            }
        }
        for (group, points) in &self.logpoints {
            if !self.enabled_groups.contains(group) {
                continue;
            }
            for bp in points {
                self.index.entry(bp.address).or_default().push(bp.clone());
            }
        }
    }

    /// All entries active at an address. Only meaningful after
    /// [`rebuild_index`](Self::rebuild_index).
    pub fn hits_at(&self, addr: u16) -> &[Breakpoint] {
        self.index.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bp(id: u16, address: u16, kind: BreakpointKind) -> Breakpoint {
        Breakpoint {
            id,
            address,
            condition: None,
            log: None,
            kind,
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut table = BreakpointTable::new();
        assert!(table.insert_user(bp(1, 0x8000, BreakpointKind::User)));
        assert!(!table.insert_user(bp(1, 0x9000, BreakpointKind::User)));
    }

    #[test]
    fn test_index_unions_all_enabled_kinds() {
        let mut table = BreakpointTable::new();
        table.insert_user(bp(1, 0x8000, BreakpointKind::User));
        table.replace_asserts(vec![bp(2, 0x8000, BreakpointKind::Assert)]);
        table.replace_logpoints("io", vec![bp(3, 0x8000, BreakpointKind::Log)]);

        table.rebuild_index();
        assert_eq!(table.hits_at(0x8000).len(), 1); // asserts and group disabled

        table.set_asserts_enabled(true);
        table.set_group_enabled("io", true);
        table.rebuild_index();
        assert_eq!(table.hits_at(0x8000).len(), 3);
    }

    #[test]
    fn test_rebuild_clears_stale_entries() {
        let mut table = BreakpointTable::new();
        table.insert_user(bp(1, 0x8000, BreakpointKind::User));
        table.set_asserts_enabled(true);
        table.replace_asserts(vec![bp(2, 0x9000, BreakpointKind::Assert)]);
        table.rebuild_index();
        assert_eq!(table.hits_at(0x8000).len(), 1);
        assert_eq!(table.hits_at(0x9000).len(), 1);

        table.remove_user(1);
        table.set_asserts_enabled(false);
        table.rebuild_index();
        assert!(table.hits_at(0x8000).is_empty());
        assert!(table.hits_at(0x9000).is_empty());
    }

    #[test]
    fn test_multiple_breakpoints_per_address() {
        let mut table = BreakpointTable::new();
        table.insert_user(bp(1, 0x8000, BreakpointKind::User));
        table.insert_user(bp(2, 0x8000, BreakpointKind::User));
        table.rebuild_index();
        assert_eq!(table.hits_at(0x8000).len(), 2);
    }

    #[test]
    fn test_watchpoint_coverage() {
        let wp = Watchpoint {
            address: 0x4000,
            size: 0x10,
            access: WatchAccess::Write,
            condition: None,
        };
        assert!(wp.covers(0x4000, true));
        assert!(wp.covers(0x400F, true));
        assert!(!wp.covers(0x4010, true));
        assert!(!wp.covers(0x3FFF, true));
        assert!(!wp.covers(0x4000, false));
    }

    #[test]
    fn test_watchpoint_removal_by_key() {
        let mut table = BreakpointTable::new();
        table.add_watchpoint(Watchpoint {
            address: 0x4000,
            size: 2,
            access: WatchAccess::ReadWrite,
            condition: None,
        });
        assert!(table.remove_watchpoint(0x4000, 4).is_none());
        assert!(table.remove_watchpoint(0x4000, 2).is_some());
        assert!(table.remove_watchpoint(0x4000, 2).is_none());
    }
}
