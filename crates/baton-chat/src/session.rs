//! Per-connection chat session
//!
//! A session turns input lines into state changes and replies. It never
//! touches a socket: replies go through the session's outbox in
//! [`ServerState`](crate::state::ServerState), which is what lets the same session run first as a
//! replay skeleton and then, after `attach_real_transport`, live.

use baton_core::{kdebug, Sender, Subsystem};
use baton_oplog::{RecordKind, ReplaySession, SharedLog};

use crate::error::ChatError;
use crate::message::Message;
use crate::state::{is_channel_name, Outbox, SessionId, SharedState};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// What the connection should do after a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush queued output, then close
    Close,
}

#[derive(Default)]
struct Registration {
    nick: Option<String>,
    username: Option<String>,
}

pub struct Session {
    id: SessionId,
    peer: String,
    state: SharedState,
    log: SharedLog,
    registration: Registration,
    /// Set once registration completes
    nick: Option<String>,
}

impl Session {
    /// A session whose output is discarded until a transport is attached
    pub fn new(id: SessionId, peer: &str, state: SharedState, log: SharedLog) -> Self {
        state.borrow_mut().set_outbox(id, Outbox::Discard);
        Self {
            id,
            peer: peer.to_string(),
            state,
            log,
            registration: Registration::default(),
            nick: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.nick.is_some()
    }

    /// Handle a line read from the socket, logging it first if it changes state
    pub fn receive_line(&mut self, line: &str) -> Result<Flow, ChatError> {
        if let Some(msg) = Message::parse(line) {
            if is_logged(&msg.command) {
                self.log
                    .borrow_mut()
                    .append(RecordKind::Message, &self.peer, Some(line));
            }
        }
        self.handle_line(line)
    }

    /// Apply one line. Recoverable errors are answered here; only fatal
    /// errors are returned.
    pub fn handle_line(&mut self, line: &str) -> Result<Flow, ChatError> {
        let Some(msg) = Message::parse(line) else {
            return Ok(Flow::Continue);
        };
        let result = if self.is_registered() {
            self.dispatch(&msg)
        } else {
            self.register_step(&msg)
        };
        match result {
            Err(e) if !e.is_fatal() => {
                self.reply_error(&e);
                Ok(Flow::Continue)
            }
            other => other,
        }
    }

    /// Send `ERROR :<reason>` ahead of closing the connection
    pub fn fail(&self, reason: &str) {
        self.send(&Message::new("ERROR", vec![reason.to_string()]));
    }

    /// Leave the server: unregister the user and drop the outbox
    pub fn close(self, reason: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(nick) = &self.nick {
            state.unregister(nick, reason);
        }
        state.remove_outbox(self.id);
        kdebug!(Subsystem::Log, "session {} ({}) closed: {}", self.id, self.peer, reason);
    }

    fn send(&self, msg: &Message) {
        self.state.borrow().send(self.id, msg);
    }

    /// Numeric reply from the server to this user
    fn reply(&self, code: &str, params: Vec<String>) {
        let state = self.state.borrow();
        let target = self.nick.clone().unwrap_or_else(|| "*".to_string());
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(target);
        all.extend(params);
        state.send(self.id, &Message::from_source(state.name(), code, all));
    }

    fn reply_error(&self, err: &ChatError) {
        if let Some(code) = err.numeric() {
            self.reply(code, err.reply_params());
        }
    }

    fn register_step(&mut self, msg: &Message) -> Result<Flow, ChatError> {
        match msg.command.as_str() {
            "CAP" => {}
            // No passwords configured; accepted and ignored
            "PASS" => {
                required(msg, 0)?;
            }
            "USER" => self.registration.username = Some(required(msg, 0)?.to_string()),
            "NICK" => {
                let nick = required(msg, 0)?;
                if self.state.borrow().nick_in_use(nick) {
                    return Err(ChatError::NickInUse(nick.to_string()));
                }
                self.registration.nick = Some(nick.to_string());
            }
            other => return Err(ChatError::NotRegistered(other.to_string())),
        }

        let (Some(nick), Some(username)) = (self.registration.nick.clone(), self.registration.username.clone())
        else {
            return Ok(Flow::Continue);
        };
        if let Err(e) = self.state.borrow_mut().register(self.id, &nick, &username) {
            self.registration.nick = None;
            return Err(e);
        }
        self.nick = Some(nick);
        self.welcome();
        Ok(Flow::Continue)
    }

    fn welcome(&self) {
        let (name, users, channels) = {
            let st = self.state.borrow();
            (st.name().to_string(), st.user_count(), st.channel_count())
        };
        let nick = self.nick.clone().unwrap_or_default();
        self.reply("001", vec![format!("Welcome to the {} network, {}", name, nick)]);
        self.reply("002", vec![format!("Your host is {}, running version {}", name, VERSION)]);
        self.reply("003", vec!["This server has no creation date".into()]);
        self.reply("004", vec![name.clone(), VERSION.into(), "o".into(), "o".into()]);
        self.reply(
            "005",
            vec!["CHANTYPES=#&".into(), "PREFIX=(o)@".into(), "are supported by this server".into()],
        );
        self.reply("251", vec![format!("There are {} users and 0 invisible on 1 servers", users)]);
        self.reply("255", vec![format!("I have {} clients and {} channels", users, channels)]);
        self.reply("375", vec![format!("- {} Message of the day -", name)]);
        self.reply("372", vec!["- moin".into()]);
        self.reply("376", vec!["End of /MOTD command.".into()]);
    }

    fn dispatch(&mut self, msg: &Message) -> Result<Flow, ChatError> {
        let nick = self.nick.clone().unwrap_or_default();
        match msg.command.as_str() {
            "CAP" | "PONG" | "PASS" | "USER" => {}
            "PING" => {
                let name = self.state.borrow().name().to_string();
                let token = msg.param(0).unwrap_or(&name).to_string();
                self.send(&Message::from_source(&name, "PONG", vec![name.clone(), token]));
            }
            "NICK" => {
                let new = required(msg, 0)?;
                self.state.borrow_mut().rename(&nick, new)?;
                self.nick = Some(new.to_string());
            }
            "JOIN" => {
                let chans = required(msg, 0)?;
                if chans == "0" {
                    self.state.borrow_mut().part_all(&nick);
                    return Ok(Flow::Continue);
                }
                for chan in chans.split(',').filter(|c| !c.is_empty()) {
                    self.join(&nick, chan)?;
                }
            }
            "PART" => {
                let chans = required(msg, 0)?;
                for chan in chans.split(',').filter(|c| !c.is_empty()) {
                    self.state.borrow_mut().part(&nick, chan, msg.param(1))?;
                }
            }
            "TOPIC" => {
                let chan = required(msg, 0)?;
                match msg.param(1) {
                    Some(topic) => self.state.borrow_mut().set_topic(&nick, chan, topic)?,
                    None => self.reply_topic(chan)?,
                }
            }
            "PRIVMSG" => {
                let targets = required(msg, 0)?;
                let text = required(msg, 1)?;
                for target in targets.split(',').filter(|t| !t.is_empty()) {
                    self.state.borrow().privmsg(&nick, target, text)?;
                }
            }
            "MODE" => {
                let target = required(msg, 0)?;
                // Channel modes and user mode changes are not supported
                if is_channel_name(target) {
                    return Ok(Flow::Continue);
                }
                if target != nick {
                    return Err(ChatError::UsersDontMatch);
                }
                if msg.param(1).is_none() {
                    self.reply("221", vec!["+".into()]);
                }
            }
            "QUIT" => {
                let reason = msg.param(0).unwrap_or("Client quit");
                self.send(&Message::new("ERROR", vec![format!("Closing link ({})", reason)]));
                return Ok(Flow::Close);
            }
            other => return Err(ChatError::UnknownCommand(other.to_string())),
        }
        Ok(Flow::Continue)
    }

    fn join(&mut self, nick: &str, chan: &str) -> Result<(), ChatError> {
        if !is_channel_name(chan) {
            return Err(ChatError::NoSuchChannel(chan.to_string()));
        }
        let info = self.state.borrow_mut().join(nick, chan);
        match info.topic {
            Some(topic) => self.reply("332", vec![chan.to_string(), topic]),
            None => self.reply("331", vec![chan.to_string(), "No topic is set".into()]),
        }
        self.reply("353", vec!["=".into(), chan.to_string(), info.members.join(" ")]);
        self.reply("366", vec![chan.to_string(), "End of /NAMES list".into()]);
        Ok(())
    }

    fn reply_topic(&self, chan: &str) -> Result<(), ChatError> {
        let topic = self.state.borrow().topic(chan)?;
        match topic {
            Some(topic) => self.reply("332", vec![chan.to_string(), topic]),
            None => self.reply("331", vec![chan.to_string(), "No topic is set".into()]),
        }
        Ok(())
    }
}

fn required<'m>(msg: &'m Message, i: usize) -> Result<&'m str, ChatError> {
    match msg.param(i) {
        Some(p) if !p.is_empty() => Ok(p),
        _ => Err(ChatError::NeedMoreParams(msg.command.clone())),
    }
}

/// PING, PONG, PRIVMSG and MODE do not change state and are not logged
pub fn is_logged(command: &str) -> bool {
    !matches!(command, "PING" | "PONG" | "PRIVMSG" | "MODE")
}

impl ReplaySession for Session {
    type Transport = Sender<String>;

    fn deliver_replayed_message(&mut self, line: &str) {
        if let Err(e) = self.handle_line(line) {
            kdebug!(Subsystem::Log, "replayed line for {} failed: {}", self.peer, e);
        }
    }

    fn attach_real_transport(&mut self, transport: Sender<String>) {
        self.state.borrow_mut().set_outbox(self.id, Outbox::Live(transport));
    }

    fn teardown(self) {
        self.close("Connection closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("nick", &self.nick)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::{unbounded, Receiver};
    use baton_oplog::OperationLog;
    use crate::state::ServerState;

    fn setup() -> (SharedState, SharedLog) {
        (ServerState::new("srv").shared(), OperationLog::new().shared())
    }

    fn live(s: &mut Session) -> Receiver<String> {
        let (tx, rx) = unbounded();
        s.attach_real_transport(tx);
        rx
    }

    fn lines(rx: &mut Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(l) = rx.try_recv() {
            out.push(l.trim_end().to_string());
        }
        out
    }

    fn registered(state: &SharedState, log: &SharedLog, id: u64, nick: &str) -> (Session, Receiver<String>) {
        let mut s = Session::new(SessionId(id), &format!("l<->p{}", id), state.clone(), log.clone());
        let mut rx = live(&mut s);
        s.receive_line(&format!("NICK {}", nick)).unwrap();
        s.receive_line(&format!("USER {} 0 * :{}", nick, nick)).unwrap();
        assert!(s.is_registered());
        lines(&mut rx);
        (s, rx)
    }

    #[test]
    fn test_registration_welcome_burst() {
        let (state, log) = setup();
        let mut s = Session::new(SessionId(1), "l<->p1", state.clone(), log);
        let mut rx = live(&mut s);

        assert_eq!(s.receive_line("CAP LS 302").unwrap(), Flow::Continue);
        s.receive_line("NICK alice").unwrap();
        assert!(!s.is_registered());
        s.receive_line("USER alice 0 * :Alice").unwrap();

        let out = lines(&mut rx);
        let codes: Vec<&str> = out.iter().map(|l| l.split(' ').nth(1).unwrap()).collect();
        assert_eq!(
            codes,
            vec!["001", "002", "003", "004", "005", "251", "255", "375", "372", "376"]
        );
        assert!(out[0].starts_with(":srv 001 alice :Welcome"));
    }

    #[test]
    fn test_command_before_registration_is_fatal() {
        let (state, log) = setup();
        let mut s = Session::new(SessionId(1), "l<->p1", state, log);
        let err = s.handle_line("JOIN #x").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ping_join_and_numerics() {
        let (state, log) = setup();
        let (mut s, mut rx) = registered(&state, &log, 1, "alice");

        s.receive_line("PING :tok").unwrap();
        assert_eq!(lines(&mut rx), vec![":srv PONG srv :tok"]);

        s.receive_line("JOIN #x").unwrap();
        assert_eq!(
            lines(&mut rx),
            vec![
                ":alice JOIN :#x",
                ":srv 331 alice #x :No topic is set",
                ":srv 353 alice = #x :alice",
                ":srv 366 alice #x :End of /NAMES list",
            ]
        );

        s.receive_line("FROB").unwrap();
        s.receive_line("PART #nope").unwrap();
        s.receive_line("PRIVMSG bob :hi").unwrap();
        s.receive_line("TOPIC").unwrap();
        assert_eq!(
            lines(&mut rx),
            vec![
                ":srv 421 alice FROB :Unknown command",
                ":srv 403 alice #nope :No such channel",
                ":srv 401 alice bob :No such nick/channel",
                ":srv 461 alice TOPIC :Not enough parameters",
            ]
        );
    }

    #[test]
    fn test_user_mode_query() {
        let (state, log) = setup();
        let (mut s, mut rx) = registered(&state, &log, 1, "alice");
        let (_b, _brx) = registered(&state, &log, 2, "bob");

        s.receive_line("MODE alice").unwrap();
        s.receive_line("MODE bob").unwrap();
        s.receive_line("MODE bob +i").unwrap();
        s.receive_line("MODE alice +i").unwrap();
        s.receive_line("MODE #x +t").unwrap();
        s.receive_line("MODE").unwrap();
        assert_eq!(
            lines(&mut rx),
            vec![
                ":srv 221 alice :+",
                ":srv 502 alice :Cant change mode for other users",
                ":srv 502 alice :Cant change mode for other users",
                ":srv 461 alice MODE :Not enough parameters",
            ]
        );

        let log = log.borrow();
        assert!(log
            .records()
            .iter()
            .filter_map(|r| r.payload.as_deref())
            .all(|p| !p.starts_with("MODE")));
    }

    #[test]
    fn test_ampersand_channels() {
        let (state, log) = setup();
        let (mut a, mut arx) = registered(&state, &log, 1, "alice");
        let (mut b, mut brx) = registered(&state, &log, 2, "bob");

        a.receive_line("JOIN &local").unwrap();
        b.receive_line("JOIN &local").unwrap();
        assert_eq!(
            lines(&mut brx),
            vec![
                ":bob JOIN :&local",
                ":srv 331 bob &local :No topic is set",
                ":srv 353 bob = &local :alice bob",
                ":srv 366 bob &local :End of /NAMES list",
            ]
        );
        lines(&mut arx);

        b.receive_line("PRIVMSG &local :hey").unwrap();
        assert_eq!(lines(&mut arx), vec![":bob PRIVMSG &local :hey"]);

        a.receive_line("JOIN plain").unwrap();
        assert_eq!(lines(&mut arx), vec![":srv 403 alice plain :No such channel"]);
        assert_eq!(
            state.borrow().summary().channels["&local"].1,
            vec!["alice".to_string(), "bob".to_string()]
        );
    }

    #[test]
    fn test_only_state_changes_are_logged() {
        let (state, log) = setup();
        let (mut s, _rx) = registered(&state, &log, 1, "alice");
        s.receive_line("PING x").unwrap();
        s.receive_line("PRIVMSG alice :self").unwrap();
        s.receive_line("JOIN #x").unwrap();

        let log = log.borrow();
        let payloads: Vec<&str> = log.records().iter().filter_map(|r| r.payload.as_deref()).collect();
        assert_eq!(payloads, vec!["NICK alice", "USER alice 0 * :alice", "JOIN #x"]);
    }

    #[test]
    fn test_nick_in_use_then_retry() {
        let (state, log) = setup();
        let (_a, _rx) = registered(&state, &log, 1, "alice");

        let mut s = Session::new(SessionId(2), "l<->p2", state.clone(), log);
        let mut rx = live(&mut s);
        s.handle_line("NICK alice").unwrap();
        assert_eq!(lines(&mut rx), vec![":srv 433 * alice :Nickname is already in use"]);
        s.handle_line("NICK bob").unwrap();
        s.handle_line("USER bob 0 * :Bob").unwrap();
        assert_eq!(s.nick(), Some("bob"));
    }

    #[test]
    fn test_quit_closes_and_unregisters() {
        let (state, log) = setup();
        let (mut s, mut rx) = registered(&state, &log, 1, "alice");
        assert_eq!(s.handle_line("QUIT :bye").unwrap(), Flow::Close);
        assert_eq!(lines(&mut rx), vec!["ERROR :Closing link (bye)"]);

        s.close("Client quit");
        assert!(!state.borrow().nick_in_use("alice"));
        assert_eq!(state.borrow().session_count(), 0);
    }
}
