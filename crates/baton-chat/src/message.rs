//! Protocol messages
//!
//! ```text
//! [@tag[=value];...] [:source] COMMAND [param ...] [:trailing]
//! ```

use std::fmt;

/// Longest accepted input line, terminator included
pub const MAX_LINE_LEN: usize = 4096;

pub const LINE_TERMINATOR: &str = "\r\n";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub tags: Vec<(String, Option<String>)>,
    pub source: Option<String>,
    /// Uppercased
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            command: command.to_ascii_uppercase(),
            params,
            ..Self::default()
        }
    }

    pub fn from_source(source: &str, command: &str, params: Vec<String>) -> Self {
        Self {
            source: Some(source.to_string()),
            ..Self::new(command, params)
        }
    }

    /// Parse one line without its terminator. `None` if there is no command.
    pub fn parse(line: &str) -> Option<Message> {
        let mut rest = line.trim_start_matches(' ');
        let mut msg = Message::default();

        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw, tail) = split_word(stripped);
            msg.tags = raw
                .split(';')
                .filter(|t| !t.is_empty())
                .map(|t| match t.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (t.to_string(), None),
                })
                .collect();
            rest = tail;
        }

        if let Some(stripped) = rest.strip_prefix(':') {
            let (src, tail) = split_word(stripped);
            msg.source = Some(src.to_string());
            rest = tail;
        }

        let (command, mut rest) = split_word(rest);
        if command.is_empty() {
            return None;
        }
        msg.command = command.to_ascii_uppercase();

        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                msg.params.push(trailing.to_string());
                break;
            }
            let (param, tail) = split_word(rest);
            msg.params.push(param.to_string());
            rest = tail;
        }
        Some(msg)
    }

    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }
}

/// Next space-delimited word and the remainder with leading spaces removed
fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(' ') {
        Some((word, tail)) => (word, tail.trim_start_matches(' ')),
        None => (s, ""),
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_str("@")?;
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                match v {
                    Some(v) => write!(f, "{}={}", k, v)?,
                    None => f.write_str(k)?,
                }
            }
            f.write_str(" ")?;
        }
        if let Some(src) = &self.source {
            write!(f, ":{} ", src)?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, p) in self.params.iter().enumerate() {
            if i == last {
                write!(f, " :{}", p)?;
            } else {
                write!(f, " {}", p)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let m = Message::parse("@id=7;flag :nick!u@h privmsg #x :hello there").unwrap();
        assert_eq!(
            m.tags,
            vec![("id".to_string(), Some("7".to_string())), ("flag".to_string(), None)]
        );
        assert_eq!(m.source.as_deref(), Some("nick!u@h"));
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.params, vec!["#x", "hello there"]);
    }

    #[test]
    fn test_parse_middle_params_and_spaces() {
        let m = Message::parse("USER  alice 0 *   :Alice Liddell").unwrap();
        assert_eq!(m.params, vec!["alice", "0", "*", "Alice Liddell"]);

        let m = Message::parse("JOIN #a,#b").unwrap();
        assert_eq!(m.param(0), Some("#a,#b"));
        assert_eq!(m.param(1), None);

        assert!(Message::parse("").is_none());
        assert!(Message::parse(":src-only").is_none());
    }

    #[test]
    fn test_format() {
        let m = Message::from_source("srv", "001", vec!["alice".into(), "Welcome".into()]);
        assert_eq!(m.to_string(), ":srv 001 alice :Welcome");
        assert_eq!(Message::new("ping", vec![]).to_string(), "PING");
    }
}
