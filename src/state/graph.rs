//! Graph mutations with their invariants.
//!
//! Lock discipline: user locks and channel locks are never held at the
//! same time. Joins record the channel name on the user *before* touching
//! the channel, so the user's channel set is always a superset of its
//! memberships and cleanup can never miss an edge. Channel destruction
//! marks the tombstone under the channel write lock before removing the
//! map entry, so a joiner that raced the removal observes `dead` and
//! recreates instead of attaching.

use super::channel::{Channel, Member};
use super::user::{User, WhowasEntry};
use super::Fabric;
use lattice_proto::ident::{ChannelName, Hostmask, Nickname};
use lattice_proto::message::Source;
use lattice_proto::{MemberModes, MemberRank, Response, UserModes};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Why a JOIN was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDenied {
    InviteOnly,
    BadKey,
    Full,
    Banned,
    NeedRegged,
    TooManyChannels,
}

impl JoinDenied {
    pub fn numeric(self) -> Response {
        match self {
            JoinDenied::InviteOnly => Response::ERR_INVITEONLYCHAN,
            JoinDenied::BadKey => Response::ERR_BADCHANNELKEY,
            JoinDenied::Full => Response::ERR_CHANNELISFULL,
            JoinDenied::Banned => Response::ERR_BANNEDFROMCHAN,
            JoinDenied::NeedRegged => Response::ERR_NEEDREGGEDNICK,
            JoinDenied::TooManyChannels => Response::ERR_TOOMANYCHANNELS,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            JoinDenied::InviteOnly => "Cannot join channel (+i)",
            JoinDenied::BadKey => "Cannot join channel (+k)",
            JoinDenied::Full => "Cannot join channel (+l)",
            JoinDenied::Banned => "Cannot join channel (+b)",
            JoinDenied::NeedRegged => "Cannot join channel (+R)",
            JoinDenied::TooManyChannels => "You have joined too many channels",
        }
    }
}

/// A successful join.
pub struct JoinOutcome {
    pub channel: Arc<RwLock<Channel>>,
    /// The channel sprang into existence for this join.
    pub created: bool,
    /// Rank granted on entry.
    pub granted: MemberModes,
    /// The join was a no-op because the user was already a member.
    pub already_member: bool,
}

/// Everything the caller needs to announce a removed user.
pub struct RemovedUser {
    pub nick: String,
    pub source: Source,
    /// Folded names of every channel the user occupied.
    pub channels: Vec<String>,
    /// Local members (deduplicated) of those channels, minus the user.
    pub audience: Vec<String>,
}

impl Fabric {
    /// Atomically claim a nickname for a connection. The nicks map is the
    /// uniqueness authority: whoever gets the entry first wins.
    pub fn claim_nick(&self, uid: &str, nick: &Nickname) -> Result<(), ()> {
        match self.nicks.entry(nick.folded().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(held) => {
                if held.get() == uid {
                    Ok(())
                } else {
                    Err(())
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(uid.to_string());
                Ok(())
            }
        }
    }

    pub fn release_nick(&self, folded: &str, uid: &str) {
        self.nicks.remove_if(folded, |_, held| held == uid);
    }

    /// Insert a fully built user into the graph. The nick must already be
    /// claimed by this uid.
    pub fn attach_user(&self, user: User) {
        let uid = user.uid.clone();
        debug_assert!(self
            .nicks
            .get(&lattice_proto::irc_to_lower(&user.nick))
            .is_some_and(|held| *held == uid));
        self.users.insert(uid, Arc::new(RwLock::new(user)));
        crate::metrics::CONNECTED_USERS.set(self.users.len() as i64);
    }

    /// Network-wide nick change. Claims the new name, rewrites every
    /// membership snapshot, and returns the old source plus the local
    /// audience that must see the NICK line.
    pub async fn change_nick(
        &self,
        uid: &str,
        new_nick: &Nickname,
    ) -> Result<(Source, Vec<String>), ()> {
        let user_arc = self.user_by_uid(uid).ok_or(())?;

        // Claim before mutating. A pure case change maps to the same
        // folded key and stays ours.
        self.claim_nick(uid, new_nick)?;

        let (old_source, old_folded, channels) = {
            let mut user = user_arc.write().await;
            let old_source = user.source();
            let old_folded = lattice_proto::irc_to_lower(&user.nick);
            user.nick = new_nick.as_str().to_string();
            user.nick_ts = chrono::Utc::now().timestamp();
            (old_source, old_folded, user.channels.clone())
        };
        if old_folded != new_nick.folded() {
            self.release_nick(&old_folded, uid);
        }

        // Refresh membership snapshots and collect the audience.
        let mut audience: HashSet<String> = HashSet::new();
        for folded in &channels {
            let Some(chan_arc) = self.channel(folded) else {
                continue;
            };
            let mut chan = chan_arc.write().await;
            if let Some(member) = chan.members.get_mut(uid) {
                member.nick = new_nick.as_str().to_string();
            }
            for member_uid in chan.members.keys() {
                if member_uid != uid && self.senders.contains_key(member_uid) {
                    audience.insert(member_uid.clone());
                }
            }
        }

        Ok((old_source, audience.into_iter().collect()))
    }

    /// Join a user to a channel, creating it if needed.
    ///
    /// Applies the join policy in order: already-member short circuit,
    /// channel cap, then invite-only, key, limit, ban, registered-only.
    /// Network operators bypass the policy entirely. Tombstoned channels
    /// are retried.
    pub async fn join_channel(
        &self,
        uid: &str,
        name: &ChannelName,
        key: Option<&str>,
    ) -> Result<JoinOutcome, JoinDenied> {
        let user_arc = self.user_by_uid(uid).ok_or(JoinDenied::Banned)?;
        let (nick, masks, account, is_oper) = {
            let user = user_arc.read().await;
            (
                user.nick.clone(),
                user.ban_masks(),
                user.account.clone(),
                user.is_oper(),
            )
        };

        let folded = name.folded().to_string();
        let limits = self.config().limits.clone();
        let registered_founder = self.registered_channels.get(&folded).map(|f| f.clone());

        // Record the edge on the user first; undone on denial. The
        // already-member short circuit runs before every policy check —
        // a repeat JOIN by a member is silently ignored even when the
        // user sits at the channel cap.
        {
            let mut user = user_arc.write().await;
            if user.channels.contains(&folded) {
                if let Some(channel) = self.channel(&folded) {
                    return Ok(JoinOutcome {
                        channel,
                        created: false,
                        granted: MemberModes::default(),
                        already_member: true,
                    });
                }
            }
            if user.channels.len() >= limits.max_channels && !is_oper {
                return Err(JoinDenied::TooManyChannels);
            }
            user.channels.insert(folded.clone());
        }

        loop {
            let now = chrono::Utc::now().timestamp();
            let (chan_arc, created) = match self.channels.entry(folded.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let chan = Arc::new(RwLock::new(Channel::new(
                        name.as_str(),
                        now,
                        registered_founder.is_some(),
                    )));
                    slot.insert(chan.clone());
                    crate::metrics::ACTIVE_CHANNELS.set(self.channels.len() as i64);
                    (chan, true)
                }
            };

            let mut chan = chan_arc.write().await;
            if chan.dead {
                // Lost the race against destruction; retry on a fresh map
                // entry.
                drop(chan);
                continue;
            }

            if chan.members.contains_key(uid) {
                return Ok(JoinOutcome {
                    channel: chan_arc.clone(),
                    created: false,
                    granted: MemberModes::default(),
                    already_member: true,
                });
            }

            if !created && !is_oper {
                let invited = chan.invited.contains(uid);
                if chan.modes.has('i')
                    && !invited
                    && !chan.is_invite_excepted(&masks)
                {
                    undo_join(&user_arc, &folded).await;
                    return Err(JoinDenied::InviteOnly);
                }
                if let Some(required) = &chan.key {
                    if key != Some(required.as_str()) {
                        undo_join(&user_arc, &folded).await;
                        return Err(JoinDenied::BadKey);
                    }
                }
                if let Some(limit) = chan.limit {
                    if chan.members.len() as u32 >= limit {
                        undo_join(&user_arc, &folded).await;
                        return Err(JoinDenied::Full);
                    }
                }
                if chan.is_banned(&masks) && !invited {
                    crate::metrics::BANS_TRIGGERED.inc();
                    undo_join(&user_arc, &folded).await;
                    return Err(JoinDenied::Banned);
                }
                if chan.modes.has('R') && account.is_none() {
                    undo_join(&user_arc, &folded).await;
                    return Err(JoinDenied::NeedRegged);
                }
            }

            let mut granted = MemberModes::default();
            if created {
                granted.grant(MemberRank::Op);
            }
            if let Some(founder) = &registered_founder {
                if account.as_deref() == Some(founder.as_str()) {
                    granted.grant(MemberRank::Owner);
                }
            }

            chan.invited.remove(uid);
            chan.members.insert(
                uid.to_string(),
                Member {
                    nick,
                    modes: granted,
                    joined_at: now,
                },
            );

            // The user may have quit while we held only the channel lock;
            // leave no orphan membership behind.
            if !self.users.contains_key(uid) {
                chan.members.remove(uid);
                if chan.should_destroy() {
                    chan.dead = true;
                    drop(chan);
                    self.channels.remove(&folded);
                    crate::metrics::ACTIVE_CHANNELS.set(self.channels.len() as i64);
                }
                return Err(JoinDenied::Banned);
            }

            return Ok(JoinOutcome {
                channel: chan_arc.clone(),
                created,
                granted,
                already_member: false,
            });
        }
    }

    /// Remove a user from a channel (PART, KICK, or netsplit cleanup).
    /// Returns false if the user was not a member. Destroys the channel
    /// when the last member of an unregistered channel leaves.
    pub async fn leave_channel(&self, uid: &str, folded: &str) -> bool {
        let Some(chan_arc) = self.channel(folded) else {
            return false;
        };
        let removed = {
            let mut chan = chan_arc.write().await;
            let removed = chan.members.remove(uid).is_some();
            if removed && chan.should_destroy() {
                chan.dead = true;
                drop(chan);
                self.channels.remove(folded);
                crate::metrics::ACTIVE_CHANNELS.set(self.channels.len() as i64);
            }
            removed
        };
        if removed {
            if let Some(user_arc) = self.user_by_uid(uid) {
                user_arc.write().await.channels.remove(folded);
            }
        }
        removed
    }

    /// Tear a user out of the graph entirely. Idempotent; the first caller
    /// gets the cleanup summary for fan-out, later callers get `None`.
    pub async fn remove_user(&self, uid: &str) -> Option<RemovedUser> {
        let (_, user_arc) = self.users.remove(uid)?;
        crate::metrics::CONNECTED_USERS.set(self.users.len() as i64);

        let (nick, source, folded_nick, channels, whowas) = {
            let user = user_arc.read().await;
            (
                user.nick.clone(),
                user.source(),
                lattice_proto::irc_to_lower(&user.nick),
                user.channels.iter().cloned().collect::<Vec<_>>(),
                WhowasEntry {
                    nick: user.nick.clone(),
                    user: user.user.clone(),
                    host: user.visible_host.clone(),
                    realname: user.realname.clone(),
                    server: self.server.name.clone(),
                    logout_time: chrono::Utc::now().timestamp_millis(),
                },
            )
        };

        let mut audience: HashSet<String> = HashSet::new();
        for folded in &channels {
            let Some(chan_arc) = self.channel(folded) else {
                continue;
            };
            let mut chan = chan_arc.write().await;
            chan.members.remove(uid);
            chan.invited.remove(uid);
            for member_uid in chan.members.keys() {
                if self.senders.contains_key(member_uid) {
                    audience.insert(member_uid.clone());
                }
            }
            if chan.should_destroy() {
                chan.dead = true;
                drop(chan);
                self.channels.remove(folded);
                crate::metrics::ACTIVE_CHANNELS.set(self.channels.len() as i64);
            }
        }

        self.release_nick(&folded_nick, uid);
        self.senders.remove(uid);
        self.rate_limiter.forget_connection(uid);
        self.remember_whowas(whowas);

        Some(RemovedUser {
            nick,
            source,
            channels,
            audience: audience.into_iter().collect(),
        })
    }

    /// Build a local User from registration state. The visible host is
    /// cloaked immediately; the real host never reaches the wire.
    #[allow(clippy::too_many_arguments)]
    pub fn build_local_user(
        &self,
        uid: &str,
        nick: &str,
        username: &str,
        realname: &str,
        host: &str,
        ip: &str,
        account: Option<String>,
        secure: bool,
        certfp: Option<String>,
        caps: HashSet<String>,
    ) -> User {
        let visible_host = match &account {
            Some(name) => self.cloak.cloak_account(name),
            None => self.cloak.cloak_host(if host.is_empty() { ip } else { host }),
        };
        let now = chrono::Utc::now().timestamp();
        let mut modes = UserModes::default();
        if secure {
            modes.set(UserModes::SECURE, true);
        }
        if account.is_some() {
            modes.set(UserModes::REGISTERED, true);
        }
        User {
            uid: uid.to_string(),
            nick: nick.to_string(),
            user: username.to_string(),
            realname: realname.to_string(),
            host: host.to_string(),
            ip: ip.to_string(),
            visible_host,
            modes,
            account,
            away: None,
            channels: HashSet::new(),
            caps,
            certfp,
            nick_ts: now,
            connected_at: now,
            last_activity: now,
            privileges: Default::default(),
        }
    }

    /// The hostmask bans and triggers see for a user.
    pub async fn hostmask_of(&self, uid: &str) -> Option<Hostmask> {
        let user_arc = self.user_by_uid(uid)?;
        let user = user_arc.read().await;
        Some(user.hostmask())
    }
}

/// Roll back the user-side edge after a denied join.
async fn undo_join(user_arc: &Arc<RwLock<User>>, folded: &str) {
    user_arc.write().await.channels.remove(folded);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil::test_fabric;

    async fn add_user(fabric: &Fabric, nick: &str) -> String {
        let uid = fabric.uid_gen.allocate();
        let nickname = Nickname::parse(nick).unwrap();
        fabric.claim_nick(&uid, &nickname).unwrap();
        let user = fabric.build_local_user(
            &uid,
            nick,
            "u",
            "Real Name",
            "host.example",
            "192.0.2.10",
            None,
            false,
            None,
            HashSet::new(),
        );
        fabric.attach_user(user);
        uid
    }

    #[tokio::test]
    async fn nick_uniqueness_is_atomic() {
        let fabric = test_fabric().await;
        let a = add_user(&fabric, "alice").await;
        let b = fabric.uid_gen.allocate();
        // Same nick, different case: still taken.
        assert!(fabric
            .claim_nick(&b, &Nickname::parse("ALICE").unwrap())
            .is_err());
        // Re-claim by the holder is fine.
        assert!(fabric
            .claim_nick(&a, &Nickname::parse("alice").unwrap())
            .is_ok());
    }

    #[tokio::test]
    async fn join_creates_with_op_and_default_modes() {
        let fabric = test_fabric().await;
        let uid = add_user(&fabric, "alice").await;
        let name = ChannelName::parse("#lobby").unwrap();

        let outcome = fabric.join_channel(&uid, &name, None).await.unwrap();
        assert!(outcome.created);
        assert!(outcome.granted.holds(MemberRank::Op));

        let chan = outcome.channel.read().await;
        assert!(chan.modes.has('n'));
        assert!(chan.modes.has('t'));
        assert_eq!(chan.members.len(), 1);
    }

    #[tokio::test]
    async fn repeat_join_is_noop() {
        let fabric = test_fabric().await;
        let uid = add_user(&fabric, "alice").await;
        let name = ChannelName::parse("#lobby").unwrap();

        fabric.join_channel(&uid, &name, None).await.unwrap();
        let again = fabric.join_channel(&uid, &name, None).await.unwrap();
        assert!(again.already_member);
        assert_eq!(again.channel.read().await.members.len(), 1);
    }

    #[tokio::test]
    async fn repeat_join_is_noop_even_at_channel_cap() {
        let fabric = test_fabric().await;
        let uid = add_user(&fabric, "alice").await;
        let name = ChannelName::parse("#lobby").unwrap();
        fabric.join_channel(&uid, &name, None).await.unwrap();

        // Pad the user to exactly max_channels occupied channels.
        let max = fabric.config().limits.max_channels;
        {
            let user_arc = fabric.user_by_uid(&uid).unwrap();
            let mut user = user_arc.write().await;
            let mut i = 0;
            while user.channels.len() < max {
                user.channels.insert(format!("#pad{}", i));
                i += 1;
            }
        }

        // At the cap, a repeat JOIN of a joined channel stays a silent
        // no-op; only a new channel is refused.
        let again = fabric.join_channel(&uid, &name, None).await.unwrap();
        assert!(again.already_member);
        assert_eq!(
            fabric
                .join_channel(&uid, &ChannelName::parse("#new").unwrap(), None)
                .await
                .err(),
            Some(JoinDenied::TooManyChannels)
        );
    }

    #[tokio::test]
    async fn join_policy_key_and_limit_and_invite() {
        let fabric = test_fabric().await;
        let alice = add_user(&fabric, "alice").await;
        let bob = add_user(&fabric, "bob").await;
        let carol = add_user(&fabric, "carol").await;
        let name = ChannelName::parse("#locked").unwrap();

        let outcome = fabric.join_channel(&alice, &name, None).await.unwrap();
        {
            let mut chan = outcome.channel.write().await;
            chan.key = Some("sekrit".into());
            chan.limit = Some(2);
        }

        assert_eq!(
            fabric.join_channel(&bob, &name, None).await.err(),
            Some(JoinDenied::BadKey)
        );
        assert!(fabric
            .join_channel(&bob, &name, Some("sekrit"))
            .await
            .is_ok());
        // Limit of 2 reached.
        assert_eq!(
            fabric.join_channel(&carol, &name, Some("sekrit")).await.err(),
            Some(JoinDenied::Full)
        );

        // Invite-only without an invitation.
        {
            let chan_arc = outcome.channel.clone();
            let mut chan = chan_arc.write().await;
            chan.limit = None;
            chan.key = None;
            chan.modes.set('i', true);
        }
        assert_eq!(
            fabric.join_channel(&carol, &name, None).await.err(),
            Some(JoinDenied::InviteOnly)
        );
        {
            let chan_arc = outcome.channel.clone();
            chan_arc.write().await.invited.insert(carol.clone());
        }
        assert!(fabric.join_channel(&carol, &name, None).await.is_ok());
    }

    #[tokio::test]
    async fn banned_join_rejected_unless_excepted() {
        let fabric = test_fabric().await;
        let alice = add_user(&fabric, "alice").await;
        let bob = add_user(&fabric, "bob").await;
        let name = ChannelName::parse("#lobby").unwrap();

        let outcome = fabric.join_channel(&alice, &name, None).await.unwrap();
        {
            let mut chan = outcome.channel.write().await;
            chan.bans.push(crate::state::ListEntry {
                mask: "bob!*@*".into(),
                set_by: "alice".into(),
                set_at: 0,
            });
        }
        assert_eq!(
            fabric.join_channel(&bob, &name, None).await.err(),
            Some(JoinDenied::Banned)
        );
        {
            let mut chan = outcome.channel.write().await;
            chan.excepts.push(crate::state::ListEntry {
                mask: "*!u@*".into(),
                set_by: "alice".into(),
                set_at: 0,
            });
        }
        assert!(fabric.join_channel(&bob, &name, None).await.is_ok());
    }

    #[tokio::test]
    async fn last_part_destroys_unregistered_channel() {
        let fabric = test_fabric().await;
        let uid = add_user(&fabric, "alice").await;
        let name = ChannelName::parse("#temp").unwrap();

        fabric.join_channel(&uid, &name, None).await.unwrap();
        assert!(fabric.channel("#temp").is_some());
        assert!(fabric.leave_channel(&uid, "#temp").await);
        assert!(fabric.channel("#temp").is_none(), "destroyed when empty");

        // A fresh join recreates with default modes and op.
        let outcome = fabric.join_channel(&uid, &name, None).await.unwrap();
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn registered_channel_survives_emptiness() {
        let fabric = test_fabric().await;
        let uid = add_user(&fabric, "alice").await;
        fabric
            .registered_channels
            .insert("#perm".to_string(), "founder-account".to_string());
        let name = ChannelName::parse("#perm").unwrap();

        fabric.join_channel(&uid, &name, None).await.unwrap();
        assert!(fabric.leave_channel(&uid, "#perm").await);
        assert!(
            fabric.channel("#perm").is_some(),
            "registered channel persists while empty"
        );
    }

    #[tokio::test]
    async fn remove_user_cleans_everything() {
        let fabric = test_fabric().await;
        let alice = add_user(&fabric, "alice").await;
        let bob = add_user(&fabric, "bob").await;
        let name = ChannelName::parse("#lobby").unwrap();
        fabric.join_channel(&alice, &name, None).await.unwrap();
        fabric.join_channel(&bob, &name, None).await.unwrap();

        let removed = fabric.remove_user(&alice).await.unwrap();
        assert_eq!(removed.nick, "alice");
        assert!(fabric.users.get(&alice).is_none());
        assert!(fabric.uid_by_nick("alice").is_none());
        assert_eq!(
            fabric
                .channel("#lobby")
                .unwrap()
                .read()
                .await
                .members
                .len(),
            1
        );
        // Second removal is a no-op.
        assert!(fabric.remove_user(&alice).await.is_none());
        // WHOWAS remembers.
        assert_eq!(fabric.whowas_of("alice").len(), 1);
    }

    #[tokio::test]
    async fn change_nick_updates_snapshots() {
        let fabric = test_fabric().await;
        let alice = add_user(&fabric, "alice").await;
        let name = ChannelName::parse("#lobby").unwrap();
        fabric.join_channel(&alice, &name, None).await.unwrap();

        let (old_source, _) = fabric
            .change_nick(&alice, &Nickname::parse("alicia").unwrap())
            .await
            .unwrap();
        assert_eq!(old_source.name(), "alice");
        assert!(fabric.uid_by_nick("alice").is_none());
        assert_eq!(fabric.uid_by_nick("alicia"), Some(alice.clone()));

        let chan = fabric.channel("#lobby").unwrap();
        assert_eq!(chan.read().await.members[&alice].nick, "alicia");

        // Collision with an existing nick is refused atomically.
        let bob = add_user(&fabric, "bob").await;
        assert!(fabric
            .change_nick(&bob, &Nickname::parse("ALICIA").unwrap())
            .await
            .is_err());
        assert_eq!(fabric.uid_by_nick("bob"), Some(bob));
    }

    #[tokio::test]
    async fn oper_bypasses_join_policy() {
        let fabric = test_fabric().await;
        let alice = add_user(&fabric, "alice").await;
        let oper = add_user(&fabric, "opie").await;
        {
            let user_arc = fabric.user_by_uid(&oper).unwrap();
            user_arc.write().await.modes.set(UserModes::OPER, true);
        }
        let name = ChannelName::parse("#fort").unwrap();
        let outcome = fabric.join_channel(&alice, &name, None).await.unwrap();
        {
            let mut chan = outcome.channel.write().await;
            chan.modes.set('i', true);
            chan.key = Some("nope".into());
        }
        assert!(fabric.join_channel(&oper, &name, None).await.is_ok());
    }
}
