//! The authoritative in-memory state store: connections, the nickname bijection, channels and
//! their membership. Every public method here either fully applies its mutation or fully rejects
//! it — there is no partially-applied state for a caller to observe.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use wire::{is_valid_channel, is_valid_nick, RESERVED_NICK};

/// Identifies a live connection. Stable for the lifetime of the connection; never reused while
/// the connection is registered in the Directory.
pub type ConnectionId = usize;

struct ConnectionEntry {
    nick: Option<String>,
    /// Channels this connection currently belongs to. Kept in lockstep with each `ChannelEntry`'s
    /// member set, which is the authoritative side; this is the cached reverse index used to
    /// answer "what channels is C in" in O(1) for `quit` and `nick` fan-out without scanning
    /// every channel.
    channels: HashSet<String>,
}

struct ChannelEntry {
    members: HashSet<ConnectionId>,
    #[allow(dead_code)]
    created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    BadNick,
    NickInUse,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameError {
    BadNick,
    NickInUse,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonMember;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveError {
    NonMember,
    BadChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutError {
    NonExist,
    BadChannel,
}

#[derive(Default)]
pub struct Directory {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    nicks: HashMap<String, ConnectionId>,
    channels: HashMap<String, ChannelEntry>,
}

impl Directory {
    pub fn new() -> Directory {
        Directory::default()
    }

    /// Admits a freshly accepted connection with no nickname or memberships yet.
    pub fn admit(&mut self, conn: ConnectionId) {
        self.connections.insert(
            conn,
            ConnectionEntry {
                nick: None,
                channels: HashSet::new(),
            },
        );
    }

    pub fn nick_of(&self, conn: ConnectionId) -> Option<&str> {
        self.connections.get(&conn).and_then(|c| c.nick.as_deref())
    }

    pub fn connection_of(&self, nick: &str) -> Option<ConnectionId> {
        self.nicks.get(nick).copied()
    }

    pub fn is_registered(&self, conn: ConnectionId) -> bool {
        self.connections
            .get(&conn)
            .map(|c| c.nick.is_some())
            .unwrap_or(false)
    }

    /// First successful `nick` on a freshly connected socket.
    pub fn register(&mut self, conn: ConnectionId, nick: &str) -> Result<(), RegisterError> {
        if nick == RESERVED_NICK {
            return Err(RegisterError::Reserved);
        }
        if !is_valid_nick(nick) {
            return Err(RegisterError::BadNick);
        }
        if self.nicks.contains_key(nick) {
            return Err(RegisterError::NickInUse);
        }

        self.nicks.insert(nick.to_string(), conn);
        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.nick = Some(nick.to_string());
        }
        Ok(())
    }

    /// Changes an already-registered connection's nickname. The old entry is removed atomically
    /// with the new one taking effect; no observer can see both bound at once.
    pub fn rename(&mut self, conn: ConnectionId, nick: &str) -> Result<String, RenameError> {
        if nick == RESERVED_NICK {
            return Err(RenameError::Reserved);
        }
        if !is_valid_nick(nick) {
            return Err(RenameError::BadNick);
        }
        if self.nicks.contains_key(nick) {
            return Err(RenameError::NickInUse);
        }

        let old = self
            .connections
            .get(&conn)
            .and_then(|c| c.nick.clone())
            .unwrap_or_default();

        self.nicks.remove(&old);
        self.nicks.insert(nick.to_string(), conn);
        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.nick = Some(nick.to_string());
        }
        Ok(old)
    }

    /// Adds `conn` to every listed channel, creating any that don't yet exist. All-or-nothing: a
    /// single malformed channel name fails the whole call with no partial mutation.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        channels: &[String],
        now: Instant,
    ) -> Result<Vec<String>, BadChannel> {
        if channels.iter().any(|c| !is_valid_channel(c)) {
            return Err(BadChannel);
        }

        let mut newly_joined = Vec::new();
        for channel in channels {
            let entry = self.connections.get_mut(&conn).expect("unknown connection");
            if entry.channels.insert(channel.clone()) {
                newly_joined.push(channel.clone());
            }

            self.channels
                .entry(channel.clone())
                .or_insert_with(|| ChannelEntry {
                    members: HashSet::new(),
                    created_at: now,
                })
                .members
                .insert(conn);
        }

        Ok(newly_joined)
    }

    /// Removes `conn` from every listed channel. Atomic: `conn` must currently be a member of at
    /// least one of the listed channels or the call fails with `NonMember` and nothing changes.
    /// Channels left empty are deleted.
    pub fn leave(&mut self, conn: ConnectionId, channels: &[String]) -> Result<(), LeaveError> {
        if channels.iter().any(|c| !is_valid_channel(c)) {
            return Err(LeaveError::BadChannel);
        }

        let entry = self.connections.get(&conn).expect("unknown connection");
        let is_member_of_any = channels.iter().any(|c| entry.channels.contains(c));
        if !is_member_of_any {
            return Err(LeaveError::NonMember);
        }

        for channel in channels {
            if let Some(entry) = self.connections.get_mut(&conn) {
                entry.channels.remove(channel);
            }
            if let Some(chan) = self.channels.get_mut(channel) {
                chan.members.remove(&conn);
                if chan.members.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }

        Ok(())
    }

    /// Returns the channels `conn` was a member of, removes it from all of them (deleting any
    /// that become empty), drops its nickname, and forgets the connection entirely.
    pub fn quit(&mut self, conn: ConnectionId) -> Vec<String> {
        let entry = match self.connections.remove(&conn) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        if let Some(nick) = &entry.nick {
            self.nicks.remove(nick);
        }

        let mut channels: Vec<String> = entry.channels.into_iter().collect();
        channels.sort();

        for channel in &channels {
            if let Some(chan) = self.channels.get_mut(channel) {
                chan.members.remove(&conn);
                if chan.members.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }

        channels
    }

    pub fn list_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_users(&self, channel: &str) -> Option<Vec<String>> {
        let chan = self.channels.get(channel)?;
        let mut nicks: Vec<String> = chan
            .members
            .iter()
            .filter_map(|id| self.nick_of(*id))
            .map(str::to_string)
            .collect();
        nicks.sort();
        Some(nicks)
    }

    /// Channel members of `channel`, in this connection's joined-channel set, used for `nick` and
    /// `quit` fan-out. Always sorted by nickname so callers get a deterministic delivery order.
    pub fn members_of(&self, channel: &str) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .channels
            .get(channel)
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default();
        members.sort_by(|a, b| self.nick_of(*a).cmp(&self.nick_of(*b)));
        members
    }

    pub fn channels_of(&self, conn: ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .connections
            .get(&conn)
            .map(|c| c.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Resolves a fan-out target list to the deduplicated set of recipient connections, excluding
    /// `sender`. All-or-nothing: the first unresolved target aborts the whole call.
    pub fn fanout_msg(
        &self,
        sender: ConnectionId,
        targets: &[String],
    ) -> Result<Vec<ConnectionId>, FanoutError> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();

        for target in targets {
            if let Some(channel_name) = target.strip_prefix('#') {
                let _ = channel_name;
                if !is_valid_channel(target) {
                    return Err(FanoutError::BadChannel);
                }
                let chan = self.channels.get(target).ok_or(FanoutError::NonExist)?;
                let mut members: Vec<ConnectionId> = chan.members.iter().copied().collect();
                members.sort_by(|a, b| self.nick_of(*a).cmp(&self.nick_of(*b)));
                for member in members {
                    if member != sender && seen.insert(member) {
                        ordered.push(member);
                    }
                }
            } else if is_valid_nick(target) {
                let conn = self.connection_of(target).ok_or(FanoutError::NonExist)?;
                if conn != sender && seen.insert(conn) {
                    ordered.push(conn);
                }
            } else {
                return Err(FanoutError::BadChannel);
            }
        }

        Ok(ordered)
    }

    #[cfg(test)]
    fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn register_enforces_uniqueness_and_reserved_name() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.admit(2);

        assert_eq!(dir.register(1, "alice"), Ok(()));
        assert_eq!(
            dir.register(2, "alice"),
            Err(RegisterError::NickInUse)
        );
        assert_eq!(dir.register(2, "SERVER"), Err(RegisterError::Reserved));
        assert_eq!(dir.register(2, "bad nick"), Err(RegisterError::BadNick));
    }

    #[test]
    fn rename_moves_the_old_entry_atomically() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.register(1, "alice").unwrap();

        let old = dir.rename(1, "alicia").unwrap();
        assert_eq!(old, "alice");
        assert_eq!(dir.connection_of("alice"), None);
        assert_eq!(dir.connection_of("alicia"), Some(1));
    }

    #[test]
    fn join_then_leave_leaves_no_trace() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.register(1, "alice").unwrap();

        dir.join(1, &["#lobby".to_string()], now()).unwrap();
        assert!(dir.channel_exists("#lobby"));

        dir.leave(1, &["#lobby".to_string()]).unwrap();
        assert!(!dir.channel_exists("#lobby"));
        assert_eq!(dir.channels_of(1), Vec::<String>::new());
    }

    #[test]
    fn leave_keeps_channel_alive_while_other_members_remain() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.admit(2);
        dir.register(1, "alice").unwrap();
        dir.register(2, "bob").unwrap();

        dir.join(1, &["#lobby".to_string()], now()).unwrap();
        dir.join(2, &["#lobby".to_string()], now()).unwrap();

        dir.leave(1, &["#lobby".to_string()]).unwrap();
        assert!(dir.channel_exists("#lobby"));
        assert_eq!(dir.list_users("#lobby").unwrap(), vec!["bob".to_string()]);
    }

    #[test]
    fn join_rejects_bad_channel_names_atomically() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.register(1, "alice").unwrap();

        let result = dir.join(1, &["#ok".to_string(), "no-hash".to_string()], now());
        assert_eq!(result, Err(BadChannel));
        assert!(!dir.channel_exists("#ok"));
    }

    #[test]
    fn leave_nonmember_is_atomic_and_rejected() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.register(1, "alice").unwrap();
        dir.join(1, &["#lobby".to_string()], now()).unwrap();

        let result = dir.leave(1, &["#other".to_string()]);
        assert_eq!(result, Err(LeaveError::NonMember));
        assert!(dir.channel_exists("#lobby"));
    }

    #[test]
    fn quit_clears_memberships_and_nickname() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.register(1, "alice").unwrap();
        dir.join(1, &["#lobby".to_string()], now()).unwrap();

        let left = dir.quit(1);
        assert_eq!(left, vec!["#lobby".to_string()]);
        assert_eq!(dir.connection_of("alice"), None);
        assert!(!dir.channel_exists("#lobby"));
    }

    #[test]
    fn fanout_excludes_sender_and_dedups() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.admit(2);
        dir.register(1, "alice").unwrap();
        dir.register(2, "bob").unwrap();
        dir.join(1, &["#lobby".to_string()], now()).unwrap();
        dir.join(2, &["#lobby".to_string()], now()).unwrap();

        let targets = vec!["#lobby".to_string(), "bob".to_string()];
        let result = dir.fanout_msg(1, &targets).unwrap();
        assert_eq!(result, vec![2]);
    }

    #[test]
    fn fanout_is_all_or_nothing() {
        let mut dir = Directory::new();
        dir.admit(1);
        dir.register(1, "alice").unwrap();

        let targets = vec!["carol".to_string()];
        assert_eq!(dir.fanout_msg(1, &targets), Err(FanoutError::NonExist));
    }
}
