//! Channel state.

use lattice_proto::ident::Hostmask;
use lattice_proto::{ChannelModes, MemberModes, MemberRank};
use std::collections::{HashMap, HashSet};

/// A mask entry on one of the channel lists (+b / +e / +I).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub mask: String,
    pub set_by: String,
    pub set_at: i64,
}

/// Channel topic with attribution.
#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: i64,
}

/// One membership: the edge between a user and a channel.
#[derive(Debug, Clone)]
pub struct Member {
    /// Nickname snapshot, refreshed on nick changes.
    pub nick: String,
    pub modes: MemberModes,
    pub joined_at: i64,
}

/// A channel. Exists while it has members or is registered; an empty
/// unregistered channel is destroyed and its entry tombstoned.
#[derive(Debug)]
pub struct Channel {
    /// Display-cased name.
    pub name: String,
    /// Channel timestamp (TS6): creation time, lowered on SJOIN merges.
    pub created_at: i64,
    pub topic: Option<Topic>,
    pub modes: ChannelModes,
    pub key: Option<String>,
    pub limit: Option<u32>,
    /// uid → membership.
    pub members: HashMap<String, Member>,
    pub bans: Vec<ListEntry>,
    pub excepts: Vec<ListEntry>,
    pub invex: Vec<ListEntry>,
    /// UIDs holding a live invitation (cleared on join).
    pub invited: HashSet<String>,
    /// Present in the registered-channels store: survives emptiness.
    pub registered: bool,
    /// Tombstone: set under the write lock at destruction so a joiner that
    /// raced the removal can detect it and recreate instead of attaching.
    pub dead: bool,
}

impl Channel {
    pub fn new(name: &str, now: i64, registered: bool) -> Self {
        Self {
            name: name.to_string(),
            created_at: now,
            topic: None,
            modes: ChannelModes::defaults(),
            key: None,
            limit: None,
            members: HashMap::new(),
            bans: Vec::new(),
            excepts: Vec::new(),
            invex: Vec::new(),
            invited: HashSet::new(),
            registered,
            dead: false,
        }
    }

    pub fn member_modes(&self, uid: &str) -> Option<MemberModes> {
        self.members.get(uid).map(|m| m.modes)
    }

    pub fn rank_of(&self, uid: &str) -> MemberRank {
        self.member_modes(uid).map(|m| m.highest()).unwrap_or_default()
    }

    /// Ban check: banned iff any +b mask matches and no +e mask matches.
    /// Exceptions dominate.
    pub fn is_banned(&self, masks: &[Hostmask]) -> bool {
        let hits = |list: &[ListEntry]| {
            list.iter()
                .any(|entry| masks.iter().any(|m| m.matches(&entry.mask)))
        };
        hits(&self.bans) && !hits(&self.excepts)
    }

    /// Invite-exception check (+I).
    pub fn is_invite_excepted(&self, masks: &[Hostmask]) -> bool {
        self.invex
            .iter()
            .any(|entry| masks.iter().any(|m| m.matches(&entry.mask)))
    }

    /// Add a mask to a list, refusing duplicates. Returns whether added.
    pub fn add_list_entry(list: &mut Vec<ListEntry>, entry: ListEntry) -> bool {
        if list.iter().any(|e| e.mask == entry.mask) {
            return false;
        }
        list.push(entry);
        true
    }

    /// Remove a mask from a list. Returns whether anything was removed.
    pub fn remove_list_entry(list: &mut Vec<ListEntry>, mask: &str) -> bool {
        let before = list.len();
        list.retain(|e| e.mask != mask);
        list.len() != before
    }

    /// Whether this channel should be destroyed now.
    pub fn should_destroy(&self) -> bool {
        self.members.is_empty() && !self.registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(nick: &str) -> Member {
        Member {
            nick: nick.to_string(),
            modes: MemberModes::default(),
            joined_at: 0,
        }
    }

    #[test]
    fn ban_with_exception_dominating() {
        let mut ch = Channel::new("#lobby", 100, false);
        ch.bans.push(ListEntry {
            mask: "*!*@*.evil.example".into(),
            set_by: "op".into(),
            set_at: 0,
        });
        let masks = [Hostmask::new("bad", "u", "bad.evil.example")];
        assert!(ch.is_banned(&masks));

        ch.excepts.push(ListEntry {
            mask: "bad!*@*".into(),
            set_by: "op".into(),
            set_at: 0,
        });
        assert!(!ch.is_banned(&masks), "exception dominates the ban");
    }

    #[test]
    fn ban_then_unban_restores_set() {
        let mut ch = Channel::new("#lobby", 100, false);
        let original = ch.bans.clone();
        assert!(Channel::add_list_entry(
            &mut ch.bans,
            ListEntry {
                mask: "*!*@x".into(),
                set_by: "op".into(),
                set_at: 1,
            }
        ));
        assert!(Channel::remove_list_entry(&mut ch.bans, "*!*@x"));
        assert_eq!(ch.bans, original);
    }

    #[test]
    fn duplicate_list_entries_refused() {
        let mut ch = Channel::new("#lobby", 100, false);
        let entry = ListEntry {
            mask: "*!*@x".into(),
            set_by: "op".into(),
            set_at: 1,
        };
        assert!(Channel::add_list_entry(&mut ch.bans, entry.clone()));
        assert!(!Channel::add_list_entry(&mut ch.bans, entry));
        assert_eq!(ch.bans.len(), 1);
    }

    #[test]
    fn destruction_policy() {
        let mut ch = Channel::new("#temp", 100, false);
        assert!(ch.should_destroy());
        ch.members.insert("0LTAAAAAA".into(), member("alice"));
        assert!(!ch.should_destroy());
        ch.members.clear();
        assert!(ch.should_destroy());

        let registered = Channel::new("#perm", 100, true);
        assert!(!registered.should_destroy());
    }
}
