//-
// Copyright (c) 2024, 2025, Jason Lingle
//
// This file is part of Tridove.
//
// Tridove is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tridove is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tridove. If not, see <http://www.gnu.org/licenses/>.

//! The POP3 state machine: AUTHORIZATION, TRANSACTION, UPDATE.
//!
//! Message numbers are assigned once at login and stay stable for the whole
//! session; DELE only records a number, and the actual unlinks happen in the
//! UPDATE state entered by QUIT. Multi-line responses are byte-stuffed and
//! terminated with a lone dot by the helpers here, so handlers deal in
//! content only.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};

use super::syntax::Command;
use crate::account::maildir::Maildir;
use crate::auth::{parse_userid, DirectoryStore};
use crate::support::log_prefix::LogPrefix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Authorization,
    Transaction,
    Update,
}

#[derive(Clone, Debug)]
struct MessageInfo {
    number: usize,
    unique_id: String,
    size: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    None,
    /// Flush, then perform the server-side TLS handshake.
    StartTls,
    /// Flush and close the connection.
    Quit,
}

/// Response lines are raw bytes: RETR and TOP emit message content, which
/// need not be UTF-8.
#[derive(Debug)]
pub struct Reply {
    pub lines: Vec<Vec<u8>>,
    pub event: Event,
}

impl Reply {
    fn one(line: impl Into<Vec<u8>>) -> Self {
        Reply {
            lines: vec![line.into()],
            event: Event::None,
        }
    }

    fn err(text: &str) -> Self {
        Reply::one(format!("-ERR {}", text))
    }
}

pub struct SessionParams {
    pub log_prefix: LogPrefix,
    pub store: Arc<DirectoryStore>,
    pub maildir_root: PathBuf,
    pub host_name: String,
    pub stls_available: bool,
    pub tls_active: bool,
}

pub struct Session {
    params: SessionParams,

    state: State,
    pending_username: Option<String>,
    user: Option<(String, String)>,
    maildir: Option<Maildir>,
    messages: Vec<MessageInfo>,
    deleted: BTreeSet<usize>,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        Session {
            params,
            state: State::Authorization,
            pending_username: None,
            user: None,
            maildir: None,
            messages: Vec::new(),
            deleted: BTreeSet::new(),
        }
    }

    pub fn greeting(&self) -> String {
        format!("+OK {} POP3 server ready", self.params.host_name)
    }

    pub fn on_tls_established(&mut self) {
        self.params.tls_active = true;
        self.params.stls_available = false;
    }

    pub fn on_line(&mut self, line: &str) -> Reply {
        let Ok(command) = line.parse::<Command>() else {
            return Reply::err(if line.split_ascii_whitespace().count() > 0 {
                "Syntax error"
            } else {
                "Unknown command"
            });
        };

        match command {
            Command::User(name) => self.cmd_user(name),
            Command::Pass(password) => self.cmd_pass(password),
            Command::Stat => self.cmd_stat(),
            Command::List(n) => self.cmd_list(n),
            Command::Retr(n) => self.cmd_retr(n),
            Command::Dele(n) => self.cmd_dele(n),
            Command::Noop => self.in_transaction().unwrap_or_else(|| {
                Reply::one("+OK")
            }),
            Command::Rset => self.cmd_rset(),
            Command::Quit => self.cmd_quit(),
            Command::Top(n, lines) => self.cmd_top(n, lines),
            Command::Uidl(n) => self.cmd_uidl(n),
            Command::Capa => self.cmd_capa(),
            Command::Stls => self.cmd_stls(),
            Command::Auth(mechanism) => self.cmd_auth(mechanism),
        }
    }

    /// `Some(error reply)` when not in the TRANSACTION state.
    fn in_transaction(&self) -> Option<Reply> {
        if State::Transaction == self.state {
            None
        } else {
            Some(Reply::err("Not authenticated"))
        }
    }

    fn cmd_user(&mut self, name: String) -> Reply {
        if State::Authorization != self.state {
            return Reply::err("Already authenticated");
        }

        self.pending_username = Some(name);
        Reply::one("+OK User accepted")
    }

    fn cmd_pass(&mut self, password: String) -> Reply {
        if State::Authorization != self.state {
            return Reply::err("Already authenticated");
        }

        let Some(username) = self.pending_username.take() else {
            return Reply::err("USER command required first");
        };

        if !self.params.store.authenticate(&username, &password) {
            warn!(
                "{} Authentication failed for {username}",
                self.params.log_prefix,
            );
            return Reply::err("Authentication failed");
        }

        let (local, domain) = parse_userid(&username);
        let maildir = Maildir::new(&self.params.maildir_root, domain, local);
        if !maildir.exists() {
            if let Err(e) = maildir.initialize() {
                warn!(
                    "{} Failed to initialise maildir for {username}: {e}",
                    self.params.log_prefix,
                );
                return Reply::err("Unable to open mailbox");
            }
        }

        self.params.log_prefix.set_user(username.clone());
        self.user = Some((local.to_owned(), domain.to_owned()));
        self.load_messages(&maildir);
        self.maildir = Some(maildir);
        self.state = State::Transaction;

        info!(
            "{} Authenticated, {} messages",
            self.params.log_prefix,
            self.messages.len(),
        );
        Reply::one(format!(
            "+OK Authentication successful, {} messages",
            self.messages.len(),
        ))
    }

    fn load_messages(&mut self, maildir: &Maildir) {
        self.messages.clear();
        self.deleted.clear();

        for (ix, message) in
            maildir.list_messages("INBOX").into_iter().enumerate()
        {
            self.messages.push(MessageInfo {
                number: ix + 1,
                unique_id: message.unique_id,
                size: message.size,
            });
        }
    }

    /// Look up a message by number, treating deleted ones as absent.
    fn message(&self, number: usize) -> Option<&MessageInfo> {
        if self.deleted.contains(&number) {
            return None;
        }
        self.messages.get(number.checked_sub(1)?)
    }

    fn visible_count(&self) -> usize {
        self.messages.len() - self.deleted.len()
    }

    fn visible_size(&self) -> u64 {
        self.messages
            .iter()
            .filter(|m| !self.deleted.contains(&m.number))
            .map(|m| m.size)
            .sum()
    }

    fn cmd_stat(&mut self) -> Reply {
        if let Some(error) = self.in_transaction() {
            return error;
        }

        Reply::one(format!(
            "+OK {} {}",
            self.visible_count(),
            self.visible_size(),
        ))
    }

    fn cmd_list(&mut self, number: Option<usize>) -> Reply {
        if let Some(error) = self.in_transaction() {
            return error;
        }

        if let Some(number) = number {
            let Some(message) = self.message(number) else {
                return Reply::err("No such message");
            };
            return Reply::one(format!(
                "+OK {} {}",
                message.number, message.size,
            ));
        }

        let mut lines = vec![format!(
            "+OK {} messages ({} octets)",
            self.visible_count(),
            self.visible_size(),
        )
        .into_bytes()];
        for message in &self.messages {
            if !self.deleted.contains(&message.number) {
                lines.push(
                    format!("{} {}", message.number, message.size)
                        .into_bytes(),
                );
            }
        }
        lines.push(b".".to_vec());

        Reply {
            lines,
            event: Event::None,
        }
    }

    fn cmd_retr(&mut self, number: usize) -> Reply {
        if let Some(error) = self.in_transaction() {
            return error;
        }

        let Some(message) = self.message(number) else {
            return Reply::err("No such message");
        };

        let content = self
            .maildir
            .as_ref()
            .and_then(|m| {
                m.get_message_content("INBOX", &message.unique_id).ok()
            });
        let Some(content) = content else {
            return Reply::err("Unable to retrieve message");
        };

        let mut lines =
            vec![format!("+OK {} octets", content.len()).into_bytes()];
        push_stuffed_lines(&mut lines, &content);
        lines.push(b".".to_vec());

        Reply {
            lines,
            event: Event::None,
        }
    }

    fn cmd_top(&mut self, number: usize, body_lines: usize) -> Reply {
        if let Some(error) = self.in_transaction() {
            return error;
        }

        let Some(message) = self.message(number) else {
            return Reply::err("No such message");
        };

        let content = self
            .maildir
            .as_ref()
            .and_then(|m| {
                m.get_message_content("INBOX", &message.unique_id).ok()
            });
        let Some(content) = content else {
            return Reply::err("Unable to retrieve message");
        };

        let (headers, body) = split_headers(&content);

        let mut lines = vec![b"+OK".to_vec()];
        push_stuffed_lines(&mut lines, headers);
        if let Some(body) = body {
            lines.push(Vec::new());
            let mut body_line_buf = Vec::new();
            push_stuffed_lines(&mut body_line_buf, body);
            body_line_buf.truncate(body_lines);
            lines.append(&mut body_line_buf);
        }
        lines.push(b".".to_vec());

        Reply {
            lines,
            event: Event::None,
        }
    }

    fn cmd_dele(&mut self, number: usize) -> Reply {
        if let Some(error) = self.in_transaction() {
            return error;
        }

        if number < 1 || number > self.messages.len() {
            return Reply::err("No such message");
        }

        if !self.deleted.insert(number) {
            return Reply::err("Message already deleted");
        }

        Reply::one(format!("+OK Message {} deleted", number))
    }

    fn cmd_rset(&mut self) -> Reply {
        if let Some(error) = self.in_transaction() {
            return error;
        }

        self.deleted.clear();
        Reply::one(format!(
            "+OK {} messages restored",
            self.messages.len(),
        ))
    }

    fn cmd_uidl(&mut self, number: Option<usize>) -> Reply {
        if let Some(error) = self.in_transaction() {
            return error;
        }

        if let Some(number) = number {
            let Some(message) = self.message(number) else {
                return Reply::err("No such message");
            };
            return Reply::one(format!(
                "+OK {} {}",
                message.number, message.unique_id,
            ));
        }

        let mut lines = vec![b"+OK".to_vec()];
        for message in &self.messages {
            if !self.deleted.contains(&message.number) {
                lines.push(
                    format!("{} {}", message.number, message.unique_id)
                        .into_bytes(),
                );
            }
        }
        lines.push(b".".to_vec());

        Reply {
            lines,
            event: Event::None,
        }
    }

    /// QUIT: in TRANSACTION, enter UPDATE and apply the deferred deletions.
    fn cmd_quit(&mut self) -> Reply {
        if State::Transaction != self.state {
            return Reply {
                lines: vec![b"+OK Goodbye".to_vec()],
                event: Event::Quit,
            };
        }

        self.state = State::Update;

        let mut removed = 0usize;
        let mut removed_bytes = 0i64;
        if let Some(ref maildir) = self.maildir {
            for &number in &self.deleted {
                let message = &self.messages[number - 1];
                match maildir.delete_message("INBOX", &message.unique_id) {
                    Ok(()) => {
                        removed += 1;
                        removed_bytes += message.size as i64;
                    },
                    Err(e) => warn!(
                        "{} Failed to delete message {}: {}",
                        self.params.log_prefix, message.unique_id, e,
                    ),
                }
            }
        }

        if removed_bytes > 0 {
            if let Some((ref local, ref domain)) = self.user {
                if let Err(e) = self.params.store.add_used_bytes(
                    local,
                    domain,
                    -removed_bytes,
                ) {
                    warn!(
                        "{} Failed to update usage: {}",
                        self.params.log_prefix, e,
                    );
                }
            }
        }

        info!(
            "{} Session ended, {} messages deleted",
            self.params.log_prefix, removed,
        );
        Reply {
            lines: vec![format!(
                "+OK Goodbye, {} messages deleted",
                removed,
            )
            .into_bytes()],
            event: Event::Quit,
        }
    }

    fn cmd_capa(&mut self) -> Reply {
        let mut lines = vec![
            b"+OK Capability list follows".to_vec(),
            b"USER".to_vec(),
            b"TOP".to_vec(),
            b"UIDL".to_vec(),
            b"RESP-CODES".to_vec(),
            b"AUTH-RESP-CODE".to_vec(),
            b"PIPELINING".to_vec(),
        ];

        if self.params.stls_available && !self.params.tls_active {
            lines.push(b"STLS".to_vec());
        }

        if State::Transaction == self.state {
            lines.push(b"EXPIRE NEVER".to_vec());
        }

        lines.push(
            format!("IMPLEMENTATION {}", self.params.host_name).into_bytes(),
        );
        lines.push(b".".to_vec());

        Reply {
            lines,
            event: Event::None,
        }
    }

    fn cmd_stls(&mut self) -> Reply {
        if self.params.tls_active {
            return Reply::err("Already using TLS");
        }

        if State::Authorization != self.state {
            return Reply::err("STLS only allowed before authentication");
        }

        if !self.params.stls_available {
            return Reply::err("STLS not available");
        }

        Reply {
            lines: vec![b"+OK Begin TLS negotiation".to_vec()],
            event: Event::StartTls,
        }
    }

    fn cmd_auth(&mut self, mechanism: Option<String>) -> Reply {
        if State::Authorization != self.state {
            return Reply::err("Already authenticated");
        }

        let Some(mechanism) = mechanism else {
            return Reply {
                lines: vec![
                    b"+OK".to_vec(),
                    b"PLAIN".to_vec(),
                    b"LOGIN".to_vec(),
                    b".".to_vec(),
                ],
                event: Event::None,
            };
        };

        if "PLAIN" == mechanism || "LOGIN" == mechanism {
            Reply::err("Use USER/PASS for authentication")
        } else {
            Reply::err("Unknown authentication mechanism")
        }
    }
}

/// Append `content` to `lines` one line at a time, byte-stuffing any line
/// that begins with a dot. Line endings are normalized to CRLF by the
/// writer, so they are stripped here.
fn push_stuffed_lines(lines: &mut Vec<Vec<u8>>, content: &[u8]) {
    for line in content.split_inclusive(|&b| b'\n' == b) {
        let mut line = line;
        if line.ends_with(b"\n") {
            line = &line[..line.len() - 1];
        }
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }

        let mut out = Vec::with_capacity(line.len() + 1);
        if Some(&b'.') == line.first() {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        lines.push(out);
    }
}

/// Split a message into its header block and optional body.
fn split_headers(content: &[u8]) -> (&[u8], Option<&[u8]>) {
    if let Some(pos) = memchr::memmem::find(content, b"\r\n\r\n") {
        (&content[..pos], Some(&content[pos + 4..]))
    } else if let Some(pos) = memchr::memmem::find(content, b"\n\n") {
        (&content[..pos], Some(&content[pos + 2..]))
    } else {
        (content, None)
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    struct Setup {
        _dir: TempDir,
        store: Arc<DirectoryStore>,
        maildir: Maildir,
        maildir_root: PathBuf,
    }

    fn set_up() -> Setup {
        crate::init_test_log();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            DirectoryStore::open(&dir.path().join("users.sqlite")).unwrap(),
        );
        store
            .create_user("dib", "earth.example", "hunter2", 1 << 20)
            .unwrap();

        let maildir_root = dir.path().join("mail");
        let maildir = Maildir::new(&maildir_root, "earth.example", "dib");
        maildir.initialize().unwrap();

        Setup {
            _dir: dir,
            store,
            maildir,
            maildir_root,
        }
    }

    fn session(setup: &Setup) -> Session {
        Session::new(SessionParams {
            log_prefix: LogPrefix::new("pop3:test".to_owned()),
            store: Arc::clone(&setup.store),
            maildir_root: setup.maildir_root.clone(),
            host_name: "mail.earth.example".to_owned(),
            stls_available: true,
            tls_active: false,
        })
    }

    fn text_lines(reply: &Reply) -> Vec<String> {
        reply
            .lines
            .iter()
            .map(|l| String::from_utf8(l.clone()).unwrap())
            .collect()
    }

    fn expect(session: &mut Session, input: &str, prefix: &str) -> Vec<String> {
        let reply = session.on_line(input);
        let lines = text_lines(&reply);
        assert!(
            lines[0].starts_with(prefix),
            "for {input:?} expected {prefix:?}, got {lines:?}"
        );
        lines
    }

    fn log_in(session: &mut Session) {
        expect(session, "USER dib@earth.example", "+OK");
        expect(session, "PASS hunter2", "+OK Authentication successful");
    }

    #[test]
    fn retrieval_cycle() {
        let setup = set_up();
        let first = setup
            .maildir
            .deliver("INBOX", &[b'x'; 100])
            .unwrap();
        let _second = setup.maildir.deliver("INBOX", &[b'y'; 200]).unwrap();

        let mut session = session(&setup);
        assert!(session.greeting().starts_with("+OK mail.earth.example"));

        expect(
            &mut session,
            "USER dib@earth.example",
            "+OK User accepted",
        );
        let lines = expect(
            &mut session,
            "PASS hunter2",
            "+OK Authentication successful, 2 messages",
        );
        assert_eq!(1, lines.len());

        expect(&mut session, "STAT", "+OK 2 300");

        let lines = expect(&mut session, "LIST", "+OK 2 messages (300 octets)");
        assert_eq!("1 100", lines[1]);
        assert_eq!("2 200", lines[2]);
        assert_eq!(".", lines[3]);

        expect(&mut session, "LIST 2", "+OK 2 200");
        expect(&mut session, "LIST 9", "-ERR No such message");

        let lines = expect(&mut session, "RETR 1", "+OK 100 octets");
        assert_eq!("x".repeat(100), lines[1]);
        assert_eq!(".", lines[2]);

        let lines = expect(&mut session, "UIDL", "+OK");
        assert_eq!(format!("1 {}", first), lines[1]);
        assert_eq!(".", lines[3]);
        expect(&mut session, "UIDL 1", &format!("+OK 1 {}", first));

        expect(&mut session, "DELE 1", "+OK Message 1 deleted");
        expect(&mut session, "DELE 1", "-ERR Message already deleted");
        expect(&mut session, "STAT", "+OK 1 200");
        expect(&mut session, "RETR 1", "-ERR No such message");

        let reply = session.on_line("QUIT");
        assert_eq!(
            vec!["+OK Goodbye, 1 messages deleted".to_owned()],
            text_lines(&reply)
        );
        assert_matches!(Event::Quit, reply.event);

        // A fresh session sees only the surviving message
        let mut second_session = self::session(&setup);
        log_in(&mut second_session);
        expect(&mut second_session, "STAT", "+OK 1 200");
    }

    #[test]
    fn rset_restores_deleted() {
        let setup = set_up();
        setup.maildir.deliver("INBOX", b"one").unwrap();

        let mut session = session(&setup);
        log_in(&mut session);

        expect(&mut session, "DELE 1", "+OK");
        expect(&mut session, "STAT", "+OK 0 0");
        expect(&mut session, "RSET", "+OK 1 messages restored");
        expect(&mut session, "STAT", "+OK 1 3");

        let reply = session.on_line("QUIT");
        assert_eq!(
            vec!["+OK Goodbye, 0 messages deleted".to_owned()],
            text_lines(&reply)
        );
    }

    #[test]
    fn retr_applies_byte_stuffing() {
        let setup = set_up();
        setup
            .maildir
            .deliver("INBOX", b"A: 1\r\n\r\n.hidden\r\n..doubled\r\nplain\r\n")
            .unwrap();

        let mut session = session(&setup);
        log_in(&mut session);

        let reply = session.on_line("RETR 1");
        let lines = text_lines(&reply);
        assert_eq!("A: 1", lines[1]);
        assert_eq!("", lines[2]);
        assert_eq!("..hidden", lines[3]);
        assert_eq!("...doubled", lines[4]);
        assert_eq!("plain", lines[5]);
        assert_eq!(".", lines[6]);
    }

    #[test]
    fn top_returns_headers_and_limited_body() {
        let setup = set_up();
        setup
            .maildir
            .deliver(
                "INBOX",
                b"A: 1\r\nB: 2\r\n\r\nbody1\r\nbody2\r\nbody3\r\n",
            )
            .unwrap();

        let mut session = session(&setup);
        log_in(&mut session);

        let lines = expect(&mut session, "TOP 1 2", "+OK");
        assert_eq!(
            vec![
                "+OK".to_owned(),
                "A: 1".to_owned(),
                "B: 2".to_owned(),
                "".to_owned(),
                "body1".to_owned(),
                "body2".to_owned(),
                ".".to_owned(),
            ],
            lines
        );

        // More lines requested than exist
        let lines = expect(&mut session, "TOP 1 99", "+OK");
        assert_eq!(7, lines.len());

        expect(&mut session, "TOP 9 1", "-ERR No such message");
    }

    #[test]
    fn authorization_gating() {
        let setup = set_up();
        let mut session = session(&setup);

        expect(&mut session, "STAT", "-ERR Not authenticated");
        expect(&mut session, "LIST", "-ERR Not authenticated");
        expect(&mut session, "RETR 1", "-ERR Not authenticated");
        expect(&mut session, "DELE 1", "-ERR Not authenticated");
        expect(&mut session, "NOOP", "-ERR Not authenticated");

        expect(&mut session, "PASS nope", "-ERR USER command required first");

        expect(&mut session, "USER dib@earth.example", "+OK");
        expect(&mut session, "PASS wrong", "-ERR Authentication failed");

        // Failed PASS cleared the pending username
        expect(&mut session, "PASS hunter2", "-ERR USER command required first");

        log_in(&mut session);
        expect(&mut session, "USER again", "-ERR Already authenticated");
        expect(&mut session, "NOOP", "+OK");
    }

    #[test]
    fn quit_before_authentication() {
        let setup = set_up();
        let mut session = session(&setup);
        let reply = session.on_line("QUIT");
        assert_eq!(vec!["+OK Goodbye".to_owned()], text_lines(&reply));
        assert_matches!(Event::Quit, reply.event);
    }

    #[test]
    fn capa_reflects_state() {
        let setup = set_up();
        let mut session = session(&setup);

        let lines = expect(&mut session, "CAPA", "+OK");
        assert!(lines.contains(&"STLS".to_owned()));
        assert!(lines.contains(&"UIDL".to_owned()));
        assert!(lines.contains(&"PIPELINING".to_owned()));
        assert!(!lines.contains(&"EXPIRE NEVER".to_owned()));
        assert!(lines.contains(&"IMPLEMENTATION mail.earth.example".to_owned()));
        assert_eq!(Some(&".".to_owned()), lines.last());

        log_in(&mut session);
        let lines = expect(&mut session, "CAPA", "+OK");
        assert!(lines.contains(&"EXPIRE NEVER".to_owned()));
    }

    #[test]
    fn stls_flow() {
        let setup = set_up();
        let mut session = session(&setup);

        let reply = session.on_line("STLS");
        assert_eq!(
            vec!["+OK Begin TLS negotiation".to_owned()],
            text_lines(&reply)
        );
        assert_matches!(Event::StartTls, reply.event);

        session.on_tls_established();
        expect(&mut session, "STLS", "-ERR Already using TLS");

        let lines = expect(&mut session, "CAPA", "+OK");
        assert!(!lines.contains(&"STLS".to_owned()));

        // STLS is AUTHORIZATION-only
        let mut session2 = self::session(&setup);
        log_in(&mut session2);
        expect(
            &mut session2,
            "STLS",
            "-ERR STLS only allowed before authentication",
        );
    }

    #[test]
    fn auth_lists_mechanisms_but_defers_to_user_pass() {
        let setup = set_up();
        let mut session = session(&setup);

        let lines = expect(&mut session, "AUTH", "+OK");
        assert_eq!(
            vec![
                "+OK".to_owned(),
                "PLAIN".to_owned(),
                "LOGIN".to_owned(),
                ".".to_owned(),
            ],
            lines
        );

        expect(&mut session, "AUTH PLAIN", "-ERR Use USER/PASS");
        expect(&mut session, "AUTH XOAUTH2", "-ERR Unknown authentication");
    }

    #[test]
    fn syntax_errors() {
        let setup = set_up();
        let mut session = session(&setup);
        log_in(&mut session);

        expect(&mut session, "RETR zero", "-ERR Syntax error");
        expect(&mut session, "XYZZY", "-ERR Syntax error");
        expect(&mut session, "RETR 0", "-ERR No such message");
    }
}
