//! Error types for the chat layer

use std::io;

use thiserror::Error;

use baton_core::SchedError;
use baton_handover::UpgradeError;
use baton_oplog::{ReplayError, SnapshotError};

/// Per-session errors.
///
/// Recoverable ones are answered with a numeric reply and the session goes
/// on; fatal ones end the session with `ERROR :<reason>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("{0} :No such nick/channel")]
    NoSuchNick(String),

    #[error("{0} :No such channel")]
    NoSuchChannel(String),

    #[error("{0} :Unknown command")]
    UnknownCommand(String),

    #[error("{0} :Nickname is already in use")]
    NickInUse(String),

    #[error("{0} :You're not on that channel")]
    NotOnChannel(String),

    #[error("{0} :Not enough parameters")]
    NeedMoreParams(String),

    #[error("Cant change mode for other users")]
    UsersDontMatch,

    /// Anything but registration commands before registering
    #[error("expected one of CAP, PASS, NICK, USER before registration, got {0}")]
    NotRegistered(String),

    #[error("input line too long, must be under {0} bytes")]
    LineTooLong(usize),

    #[error("input is not valid UTF-8")]
    Encoding,
}

impl ChatError {
    /// Numeric reply code for recoverable errors
    pub fn numeric(&self) -> Option<&'static str> {
        match self {
            ChatError::NoSuchNick(_) => Some("401"),
            ChatError::NoSuchChannel(_) => Some("403"),
            ChatError::UnknownCommand(_) => Some("421"),
            ChatError::NickInUse(_) => Some("433"),
            ChatError::NotOnChannel(_) => Some("442"),
            ChatError::NeedMoreParams(_) => Some("461"),
            ChatError::UsersDontMatch => Some("502"),
            ChatError::NotRegistered(_) | ChatError::LineTooLong(_) | ChatError::Encoding => None,
        }
    }

    /// Fatal to the session
    pub fn is_fatal(&self) -> bool {
        self.numeric().is_none()
    }

    /// Parameters of the numeric reply, after the recipient's nick
    pub(crate) fn reply_params(&self) -> Vec<String> {
        let (subject, text) = match self {
            ChatError::NoSuchNick(s) => (s, "No such nick/channel"),
            ChatError::NoSuchChannel(s) => (s, "No such channel"),
            ChatError::UnknownCommand(s) => (s, "Unknown command"),
            ChatError::NickInUse(s) => (s, "Nickname is already in use"),
            ChatError::NotOnChannel(s) => (s, "You're not on that channel"),
            ChatError::NeedMoreParams(s) => (s, "Not enough parameters"),
            _ => return vec![self.to_string()],
        };
        vec![subject.clone(), text.to_string()]
    }
}

/// Server startup and handover failures
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("runtime: {0}")]
    Runtime(#[from] SchedError),

    #[error("upgrade: {0}")]
    Upgrade(#[from] UpgradeError),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("replay: {0}")]
    Replay(#[from] ReplayError),

    #[error("no address to listen on")]
    NoListeners,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
