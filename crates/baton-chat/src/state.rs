//! Shared chat state: users, channels and per-session outboxes
//!
//! Every write to a client goes through its outbox. An outbox is either
//! `Discard` (a session being rebuilt by replay) or `Live` (the sending half
//! of the channel drained by the connection's writer task), so replayed
//! sessions produce no output without the chat rules knowing about it.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use baton_core::Sender;

use crate::error::ChatError;
use crate::message::{Message, LINE_TERMINATOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// `#` and `&` prefix channel names
pub fn is_channel_name(name: &str) -> bool {
    name.starts_with(['#', '&'])
}

/// Where a session's output goes
pub enum Outbox {
    Discard,
    Live(Sender<String>),
}

struct User {
    username: String,
    session: SessionId,
}

#[derive(Default)]
struct Channel {
    topic: Option<String>,
    members: BTreeSet<String>,
}

/// Reply data for a successful JOIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    pub topic: Option<String>,
    pub members: Vec<String>,
}

/// Comparable view of the state, without outboxes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSummary {
    /// nick -> username
    pub users: BTreeMap<String, String>,
    /// channel -> (topic, members)
    pub channels: BTreeMap<String, (Option<String>, Vec<String>)>,
}

pub struct ServerState {
    name: String,
    users: BTreeMap<String, User>,
    channels: BTreeMap<String, Channel>,
    outboxes: HashMap<SessionId, Outbox>,
}

pub type SharedState = Rc<RefCell<ServerState>>;

impl ServerState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            users: BTreeMap::new(),
            channels: BTreeMap::new(),
            outboxes: HashMap::new(),
        }
    }

    pub fn shared(self) -> SharedState {
        Rc::new(RefCell::new(self))
    }

    /// Server name used as the source of numeric replies
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn session_count(&self) -> usize {
        self.outboxes.len()
    }

    // ---- outboxes ----

    /// Set (or replace) where a session's output goes
    pub fn set_outbox(&mut self, id: SessionId, outbox: Outbox) {
        self.outboxes.insert(id, outbox);
    }

    pub fn remove_outbox(&mut self, id: SessionId) {
        self.outboxes.remove(&id);
    }

    pub fn send(&self, id: SessionId, msg: &Message) {
        if let Some(Outbox::Live(tx)) = self.outboxes.get(&id) {
            // Unbounded, so this only fails once the connection is closing
            let _ = tx.try_send(format!("{}{}", msg, LINE_TERMINATOR));
        }
    }

    fn send_to_nick(&self, nick: &str, msg: &Message) {
        if let Some(user) = self.users.get(nick) {
            self.send(user.session, msg);
        }
    }

    fn broadcast_channel(&self, chan: &Channel, msg: &Message, except: Option<&str>) {
        for member in chan.members.iter().filter(|m| Some(m.as_str()) != except) {
            self.send_to_nick(member, msg);
        }
    }

    // ---- users ----

    pub fn nick_in_use(&self, nick: &str) -> bool {
        self.users.contains_key(nick)
    }

    pub fn register(&mut self, id: SessionId, nick: &str, username: &str) -> Result<(), ChatError> {
        if self.nick_in_use(nick) {
            return Err(ChatError::NickInUse(nick.to_string()));
        }
        self.users.insert(
            nick.to_string(),
            User { username: username.to_string(), session: id },
        );
        Ok(())
    }

    /// Change nick everywhere and tell every user
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), ChatError> {
        if old == new {
            return Ok(());
        }
        if self.nick_in_use(new) {
            return Err(ChatError::NickInUse(new.to_string()));
        }
        let Some(user) = self.users.remove(old) else {
            return Err(ChatError::NoSuchNick(old.to_string()));
        };
        self.users.insert(new.to_string(), user);
        for chan in self.channels.values_mut() {
            if chan.members.remove(old) {
                chan.members.insert(new.to_string());
            }
        }
        let msg = Message::from_source(old, "NICK", vec![new.to_string()]);
        for user in self.users.values() {
            self.send(user.session, &msg);
        }
        Ok(())
    }

    /// Drop a user, telling everyone who shares a channel with them
    pub fn unregister(&mut self, nick: &str, reason: &str) {
        if self.users.remove(nick).is_none() {
            return;
        }
        let msg = Message::from_source(nick, "QUIT", vec![reason.to_string()]);
        let mut told = BTreeSet::new();
        for chan in self.channels.values_mut() {
            if chan.members.remove(nick) {
                told.extend(chan.members.iter().cloned());
            }
        }
        for other in &told {
            self.send_to_nick(other, &msg);
        }
    }

    // ---- channels ----

    pub fn join(&mut self, nick: &str, chan_name: &str) -> JoinInfo {
        let chan = self.channels.entry(chan_name.to_string()).or_default();
        chan.members.insert(nick.to_string());
        let info = JoinInfo {
            topic: chan.topic.clone(),
            members: chan.members.iter().cloned().collect(),
        };
        let msg = Message::from_source(nick, "JOIN", vec![chan_name.to_string()]);
        if let Some(chan) = self.channels.get(chan_name) {
            self.broadcast_channel(chan, &msg, None);
        }
        info
    }

    pub fn part(&mut self, nick: &str, chan_name: &str, reason: Option<&str>) -> Result<(), ChatError> {
        let Some(chan) = self.channels.get(chan_name) else {
            return Err(ChatError::NoSuchChannel(chan_name.to_string()));
        };
        if !chan.members.contains(nick) {
            return Err(ChatError::NotOnChannel(chan_name.to_string()));
        }
        let mut params = vec![chan_name.to_string()];
        params.extend(reason.map(str::to_string));
        let msg = Message::from_source(nick, "PART", params);
        self.broadcast_channel(chan, &msg, None);
        if let Some(chan) = self.channels.get_mut(chan_name) {
            chan.members.remove(nick);
        }
        Ok(())
    }

    /// Leave every channel; returns the channels left
    pub fn part_all(&mut self, nick: &str) -> Vec<String> {
        let joined: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| c.members.contains(nick))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &joined {
            let _ = self.part(nick, name, None);
        }
        joined
    }

    pub fn topic(&self, chan_name: &str) -> Result<Option<String>, ChatError> {
        self.channels
            .get(chan_name)
            .map(|c| c.topic.clone())
            .ok_or_else(|| ChatError::NoSuchChannel(chan_name.to_string()))
    }

    /// Set the topic (empty clears it) and tell every member
    pub fn set_topic(&mut self, nick: &str, chan_name: &str, topic: &str) -> Result<(), ChatError> {
        let Some(chan) = self.channels.get_mut(chan_name) else {
            return Err(ChatError::NoSuchChannel(chan_name.to_string()));
        };
        if !chan.members.contains(nick) {
            return Err(ChatError::NotOnChannel(chan_name.to_string()));
        }
        chan.topic = (!topic.is_empty()).then(|| topic.to_string());
        let msg = Message::from_source(nick, "TOPIC", vec![chan_name.to_string(), topic.to_string()]);
        if let Some(chan) = self.channels.get(chan_name) {
            self.broadcast_channel(chan, &msg, None);
        }
        Ok(())
    }

    pub fn privmsg(&self, from: &str, target: &str, text: &str) -> Result<(), ChatError> {
        let msg = Message::from_source(from, "PRIVMSG", vec![target.to_string(), text.to_string()]);
        if is_channel_name(target) {
            let chan = self
                .channels
                .get(target)
                .ok_or_else(|| ChatError::NoSuchChannel(target.to_string()))?;
            if !chan.members.contains(from) {
                return Err(ChatError::NotOnChannel(target.to_string()));
            }
            self.broadcast_channel(chan, &msg, Some(from));
            return Ok(());
        }
        if !self.nick_in_use(target) {
            return Err(ChatError::NoSuchNick(target.to_string()));
        }
        self.send_to_nick(target, &msg);
        Ok(())
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            users: self
                .users
                .iter()
                .map(|(nick, u)| (nick.clone(), u.username.clone()))
                .collect(),
            channels: self
                .channels
                .iter()
                .map(|(name, c)| (name.clone(), (c.topic.clone(), c.members.iter().cloned().collect())))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::{unbounded, Receiver};

    fn live(state: &mut ServerState, id: u64) -> Receiver<String> {
        let (tx, rx) = unbounded();
        state.set_outbox(SessionId(id), Outbox::Live(tx));
        rx
    }

    fn drain(rx: &mut Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line.trim_end().to_string());
        }
        out
    }

    #[test]
    fn test_join_broadcasts_to_members() {
        let mut st = ServerState::new("srv");
        let mut a = live(&mut st, 1);
        let mut b = live(&mut st, 2);
        st.register(SessionId(1), "alice", "a").unwrap();
        st.register(SessionId(2), "bob", "b").unwrap();

        st.join("alice", "#x");
        let info = st.join("bob", "#x");
        assert_eq!(info.members, vec!["alice", "bob"]);

        assert_eq!(drain(&mut a), vec![":alice JOIN :#x", ":bob JOIN :#x"]);
        assert_eq!(drain(&mut b), vec![":bob JOIN :#x"]);
    }

    #[test]
    fn test_discard_outbox_is_silent() {
        let mut st = ServerState::new("srv");
        st.set_outbox(SessionId(1), Outbox::Discard);
        st.register(SessionId(1), "alice", "a").unwrap();
        st.join("alice", "#x");

        let mut rx = live(&mut st, 1);
        st.privmsg("alice", "alice", "hi").unwrap();
        assert_eq!(drain(&mut rx), vec![":alice PRIVMSG alice :hi"]);
    }

    #[test]
    fn test_nick_rules() {
        let mut st = ServerState::new("srv");
        st.register(SessionId(1), "alice", "a").unwrap();
        st.register(SessionId(2), "bob", "b").unwrap();
        assert_eq!(
            st.register(SessionId(3), "bob", "c"),
            Err(ChatError::NickInUse("bob".into()))
        );

        st.join("alice", "#x");
        assert_eq!(st.rename("alice", "bob"), Err(ChatError::NickInUse("bob".into())));
        st.rename("alice", "carol").unwrap();
        assert_eq!(st.summary().channels["#x"].1, vec!["carol"]);
    }

    #[test]
    fn test_part_topic_privmsg_errors() {
        let mut st = ServerState::new("srv");
        st.register(SessionId(1), "alice", "a").unwrap();
        assert_eq!(st.part("alice", "#none", None), Err(ChatError::NoSuchChannel("#none".into())));
        st.join("alice", "#x");
        st.register(SessionId(2), "bob", "b").unwrap();

        assert_eq!(st.set_topic("bob", "#x", "t"), Err(ChatError::NotOnChannel("#x".into())));
        st.set_topic("alice", "#x", "hello").unwrap();
        assert_eq!(st.topic("#x").unwrap().as_deref(), Some("hello"));

        assert_eq!(st.privmsg("bob", "#x", "hi"), Err(ChatError::NotOnChannel("#x".into())));
        assert_eq!(st.privmsg("bob", "carol", "hi"), Err(ChatError::NoSuchNick("carol".into())));

        assert_eq!(st.part_all("alice"), vec!["#x".to_string()]);
        assert!(st.summary().channels["#x"].1.is_empty());
    }

    #[test]
    fn test_unregister_tells_channel_peers_once() {
        let mut st = ServerState::new("srv");
        let mut b = live(&mut st, 2);
        st.register(SessionId(1), "alice", "a").unwrap();
        st.register(SessionId(2), "bob", "b").unwrap();
        for chan in ["#x", "#y"] {
            st.join("alice", chan);
            st.join("bob", chan);
        }
        drain(&mut b);

        st.unregister("alice", "gone");
        assert_eq!(drain(&mut b), vec![":alice QUIT :gone"]);
        assert!(!st.nick_in_use("alice"));
    }
}
