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

//! The IMAP4rev1 session core.
//!
//! A session moves through four states: not-authenticated, authenticated,
//! selected, logout. Selecting a mailbox takes a snapshot of its messages;
//! sequence numbers are positions in that snapshot and UIDs are handed out
//! from a session-local counter that never decreases, so a UID observed
//! once in a session never points at a different message later, even
//! across reselects and expunges.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{info, warn};

use super::syntax::{self, FetchItemKind, SearchKeyKind, StoreActionKind};
use crate::account::maildir::Maildir;
use crate::account::model::{Flag, FlagSet};
use crate::auth::DirectoryStore;
use crate::support::log_prefix::LogPrefix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

/// An in-progress AUTHENTICATE exchange; the tag is needed for the final
/// tagged reply.
#[derive(Clone, Debug, PartialEq, Eq)]
enum AuthPending {
    None,
    Plain(String),
    LoginUsername(String),
    LoginPassword(String, String),
}

/// One message in the selected-mailbox snapshot.
#[derive(Clone, Debug)]
struct CachedMessage {
    seq: u32,
    uid: u32,
    unique_id: String,
    size: u64,
    flags: FlagSet,
    /// Session-local: the file was in `new/` when the snapshot was taken.
    recent: bool,
    internal_date: DateTime<Local>,
}

#[derive(Clone, Debug)]
struct SelectedMailbox {
    name: String,
    read_only: bool,
    uid_validity: u32,
    unseen: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    None,
    /// Flush, then perform the server-side TLS handshake.
    StartTls,
    /// Flush and close the connection.
    Logout,
}

/// Response lines are raw bytes: FETCH responses can embed literal message
/// content.
#[derive(Debug)]
pub struct Reply {
    pub lines: Vec<Vec<u8>>,
    pub event: Event,
}

impl Reply {
    fn lines(lines: Vec<Vec<u8>>) -> Self {
        Reply {
            lines,
            event: Event::None,
        }
    }

    fn one(line: Vec<u8>) -> Self {
        Reply::lines(vec![line])
    }
}

mod response {
    pub fn untagged(text: &str) -> Vec<u8> {
        format!("* {}", text).into_bytes()
    }

    pub fn ok(tag: &str, text: &str) -> Vec<u8> {
        format!("{} OK {}", tag, text).into_bytes()
    }

    pub fn no(tag: &str, text: &str) -> Vec<u8> {
        format!("{} NO {}", tag, text).into_bytes()
    }

    pub fn bad(tag: &str, text: &str) -> Vec<u8> {
        format!("{} BAD {}", tag, text).into_bytes()
    }

    pub fn bye(text: &str) -> Vec<u8> {
        format!("* BYE {}", text).into_bytes()
    }

    pub fn cont(text: &str) -> Vec<u8> {
        format!("+ {}", text).into_bytes()
    }
}

static MAILBOX_FLAGS: &str =
    "(\\Answered \\Flagged \\Deleted \\Seen \\Draft)";
static PERMANENT_FLAGS: &str =
    "(\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)";

pub struct SessionParams {
    pub log_prefix: LogPrefix,
    pub store: Arc<DirectoryStore>,
    pub maildir_root: PathBuf,
    pub host_name: String,
    pub starttls_available: bool,
    pub tls_active: bool,
}

pub struct Session {
    params: SessionParams,

    state: State,
    auth_pending: AuthPending,
    maildir: Option<Maildir>,
    selected: Option<SelectedMailbox>,
    messages: Vec<CachedMessage>,
    uid_to_seq: HashMap<u32, u32>,
    /// Session-local UID allocator; monotonic across reselects.
    next_uid: u32,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        Session {
            params,
            state: State::NotAuthenticated,
            auth_pending: AuthPending::None,
            maildir: None,
            selected: None,
            messages: Vec::new(),
            uid_to_seq: HashMap::new(),
            next_uid: 1,
        }
    }

    pub fn greeting(&self) -> String {
        format!("* OK {} IMAP4rev1 Service Ready", self.params.host_name)
    }

    pub fn logged_out(&self) -> bool {
        State::Logout == self.state
    }

    pub fn on_tls_established(&mut self) {
        self.params.tls_active = true;
        self.params.starttls_available = false;
    }

    pub fn on_line(&mut self, line: &str) -> Reply {
        if AuthPending::None != self.auth_pending {
            return self.continue_authenticate(line);
        }

        let Some(command) = syntax::parse_command_line(line) else {
            return Reply::one(response::bad("*", "Invalid command"));
        };

        let tag = command.tag;
        let args = command.arguments;

        match command.name.as_str() {
            "CAPABILITY" => self.cmd_capability(&tag),
            "NOOP" => Reply::one(response::ok(&tag, "NOOP completed")),
            "LOGOUT" => self.cmd_logout(&tag),
            "STARTTLS" => self.cmd_starttls(&tag),
            "AUTHENTICATE" => self.cmd_authenticate(&tag, &args),
            "LOGIN" => self.cmd_login(&tag, &args),
            "SELECT" => self.cmd_select(&tag, &args, false),
            "EXAMINE" => self.cmd_select(&tag, &args, true),
            "CREATE" => self.cmd_create(&tag, &args),
            "DELETE" => self.cmd_delete(&tag, &args),
            "RENAME" => self.cmd_rename(&tag, &args),
            "SUBSCRIBE" | "UNSUBSCRIBE" => {
                // Subscriptions are not tracked
                match self.require_authenticated(&tag) {
                    Some(error) => error,
                    None => Reply::one(response::ok(
                        &tag,
                        &format!("{} completed", command.name),
                    )),
                }
            },
            "LIST" => self.cmd_list(&tag, &args, false),
            "LSUB" => self.cmd_list(&tag, &args, true),
            "STATUS" => self.cmd_status(&tag, &args),
            "APPEND" => match self.require_authenticated(&tag) {
                Some(error) => error,
                None => Reply::one(response::no(
                    &tag,
                    "APPEND not supported (no literal support)",
                )),
            },
            "CHECK" => match self.require_selected(&tag) {
                Some(error) => error,
                None => Reply::one(response::ok(&tag, "CHECK completed")),
            },
            "CLOSE" => self.cmd_close(&tag),
            "EXPUNGE" => self.cmd_expunge(&tag),
            "SEARCH" => self.cmd_search(&tag, &args, false),
            "FETCH" => self.cmd_fetch(&tag, &args, false),
            "STORE" => self.cmd_store(&tag, &args, false),
            "COPY" => self.cmd_copy(&tag, &args, false),
            "UID" => self.cmd_uid(&tag, &args),
            _ => Reply::one(response::bad(&tag, "Unknown command")),
        }
    }

    /// `Some(error reply)` when not yet authenticated.
    fn require_authenticated(&self, tag: &str) -> Option<Reply> {
        match self.state {
            State::Authenticated | State::Selected => None,
            _ => Some(Reply::one(response::bad(tag, "Not authenticated"))),
        }
    }

    fn require_selected(&self, tag: &str) -> Option<Reply> {
        if State::Selected == self.state {
            None
        } else {
            Some(Reply::one(response::bad(tag, "No mailbox selected")))
        }
    }

    fn cmd_capability(&self, tag: &str) -> Reply {
        let mut caps =
            "CAPABILITY IMAP4rev1 AUTH=PLAIN AUTH=LOGIN".to_owned();
        if self.params.starttls_available && !self.params.tls_active {
            caps.push_str(" STARTTLS");
        }
        if matches!(self.state, State::Authenticated | State::Selected) {
            caps.push_str(" CHILDREN NAMESPACE");
        }

        Reply::lines(vec![
            response::untagged(&caps),
            response::ok(tag, "CAPABILITY completed"),
        ])
    }

    fn cmd_logout(&mut self, tag: &str) -> Reply {
        self.state = State::Logout;
        Reply {
            lines: vec![
                response::bye("Logging out"),
                response::ok(tag, "LOGOUT completed"),
            ],
            event: Event::Logout,
        }
    }

    fn cmd_starttls(&mut self, tag: &str) -> Reply {
        if self.params.tls_active {
            return Reply::one(response::bad(tag, "Already using TLS"));
        }

        if State::NotAuthenticated != self.state {
            return Reply::one(response::bad(
                tag,
                "STARTTLS only allowed before authentication",
            ));
        }

        if !self.params.starttls_available {
            return Reply::one(response::no(tag, "TLS not configured"));
        }

        Reply {
            lines: vec![response::ok(tag, "Begin TLS negotiation")],
            event: Event::StartTls,
        }
    }

    fn cmd_login(&mut self, tag: &str, args: &str) -> Reply {
        if State::NotAuthenticated != self.state {
            return Reply::one(response::bad(tag, "Already authenticated"));
        }

        let mut pos = 0;
        let username = syntax::parse_string(args, &mut pos);
        let password = syntax::parse_string(args, &mut pos);
        let (Some(username), Some(password)) = (username, password) else {
            return Reply::one(response::bad(
                tag,
                "Missing username or password",
            ));
        };

        self.finish_auth(tag, &username, &password, "LOGIN")
    }

    fn cmd_authenticate(&mut self, tag: &str, args: &str) -> Reply {
        if State::NotAuthenticated != self.state {
            return Reply::one(response::bad(tag, "Already authenticated"));
        }

        let mechanism = args.trim().to_ascii_uppercase();
        if "PLAIN" == mechanism {
            self.auth_pending = AuthPending::Plain(tag.to_owned());
            Reply::one(response::cont(""))
        } else if "LOGIN" == mechanism {
            self.auth_pending = AuthPending::LoginUsername(tag.to_owned());
            Reply::one(response::cont(&base64::encode("Username:")))
        } else {
            Reply::one(response::no(
                tag,
                "Unsupported authentication mechanism",
            ))
        }
    }

    fn continue_authenticate(&mut self, line: &str) -> Reply {
        let pending =
            std::mem::replace(&mut self.auth_pending, AuthPending::None);

        let tag = match pending {
            AuthPending::Plain(ref tag)
            | AuthPending::LoginUsername(ref tag)
            | AuthPending::LoginPassword(ref tag, _) => tag.clone(),
            AuthPending::None => unreachable!(),
        };

        if "*" == line {
            return Reply::one(response::bad(&tag, "AUTHENTICATE aborted"));
        }

        match pending {
            AuthPending::Plain(_) => {
                let Ok(decoded) = base64::decode(line) else {
                    return Reply::one(response::bad(&tag, "Invalid base64"));
                };
                let decoded = String::from_utf8_lossy(&decoded).into_owned();

                let mut parts = decoded.split('\x00');
                let (
                    Some(authorise),
                    Some(authenticate),
                    Some(password),
                    None,
                ) = (parts.next(), parts.next(), parts.next(), parts.next())
                else {
                    return Reply::one(response::bad(
                        &tag,
                        "Invalid credentials format",
                    ));
                };

                if !authorise.is_empty() && authorise != authenticate {
                    return Reply::one(response::no(
                        &tag,
                        "[AUTHENTICATIONFAILED] Authentication failed",
                    ));
                }

                let authenticate = authenticate.to_owned();
                let password = password.to_owned();
                self.finish_auth(&tag, &authenticate, &password, "AUTHENTICATE")
            },

            AuthPending::LoginUsername(_) => match base64::decode(line) {
                Ok(username) => {
                    self.auth_pending = AuthPending::LoginPassword(
                        tag,
                        String::from_utf8_lossy(&username).into_owned(),
                    );
                    Reply::one(response::cont(&base64::encode("Password:")))
                },
                Err(_) => {
                    Reply::one(response::bad(&tag, "Invalid base64"))
                },
            },

            AuthPending::LoginPassword(_, username) => {
                match base64::decode(line) {
                    Ok(password) => {
                        let password =
                            String::from_utf8_lossy(&password).into_owned();
                        self.finish_auth(
                            &tag,
                            &username,
                            &password,
                            "AUTHENTICATE",
                        )
                    },
                    Err(_) => {
                        Reply::one(response::bad(&tag, "Invalid base64"))
                    },
                }
            },

            AuthPending::None => unreachable!(),
        }
    }

    fn finish_auth(
        &mut self,
        tag: &str,
        username: &str,
        password: &str,
        command: &str,
    ) -> Reply {
        if !self.params.store.authenticate(username, password) {
            warn!(
                "{} Authentication failed for {username}",
                self.params.log_prefix,
            );
            return Reply::one(response::no(
                tag,
                "[AUTHENTICATIONFAILED] Authentication failed",
            ));
        }

        let (local, domain) = crate::auth::parse_userid(username);
        let maildir = Maildir::new(&self.params.maildir_root, domain, local);
        if !maildir.exists() {
            if let Err(e) = maildir.initialize() {
                warn!(
                    "{} Failed to initialise maildir for {username}: {e}",
                    self.params.log_prefix,
                );
                return Reply::one(response::no(tag, "Unable to open mailbox"));
            }
        }

        info!("{} Authenticated as {username}", self.params.log_prefix);
        self.params.log_prefix.set_user(username.to_owned());
        self.maildir = Some(maildir);
        self.state = State::Authenticated;
        Reply::one(response::ok(tag, &format!("{} completed", command)))
    }

    fn cmd_select(&mut self, tag: &str, args: &str, read_only: bool) -> Reply {
        if let Some(error) = self.require_authenticated(tag) {
            return error;
        }

        let mut pos = 0;
        let mailbox = syntax::parse_string(args, &mut pos)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "INBOX".to_owned());

        let maildir = self.maildir.as_ref().unwrap();
        if !maildir.mailbox_exists(&mailbox) {
            return Reply::one(response::no(tag, "Mailbox does not exist"));
        }

        let uid_validity = match maildir.get_uid_validity(&mailbox) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "{} Failed to read UIDVALIDITY of {mailbox}: {e}",
                    self.params.log_prefix,
                );
                return Reply::one(response::no(
                    tag,
                    "Failed to select mailbox",
                ));
            },
        };

        self.load_messages(&mailbox);

        let exists = self.messages.len();
        let recent = self.messages.iter().filter(|m| m.recent).count();
        let unseen = self
            .messages
            .iter()
            .filter(|m| !m.flags.contains(&Flag::Seen))
            .count();

        info!(
            "{} Selected {} ({} messages, uidvalidity {})",
            self.params.log_prefix, mailbox, exists, uid_validity,
        );
        self.selected = Some(SelectedMailbox {
            name: mailbox,
            read_only,
            uid_validity,
            unseen,
        });
        self.state = State::Selected;

        let mut lines = vec![
            response::untagged(&format!("{} EXISTS", exists)),
            response::untagged(&format!("{} RECENT", recent)),
        ];

        if read_only {
            lines.push(response::untagged(&format!(
                "FLAGS {}",
                MAILBOX_FLAGS
            )));
            lines.push(response::ok(
                tag,
                "[READ-ONLY] EXAMINE completed",
            ));
        } else {
            if unseen > 0 {
                lines.push(response::untagged(&format!(
                    "OK [UNSEEN {}]",
                    unseen
                )));
            }
            lines.push(response::untagged(&format!(
                "OK [UIDVALIDITY {}]",
                uid_validity
            )));
            lines.push(response::untagged(&format!(
                "OK [UIDNEXT {}]",
                self.next_uid
            )));
            lines.push(response::untagged(&format!(
                "FLAGS {}",
                MAILBOX_FLAGS
            )));
            lines.push(response::untagged(&format!(
                "OK [PERMANENTFLAGS {}]",
                PERMANENT_FLAGS
            )));
            lines.push(response::ok(tag, "[READ-WRITE] SELECT completed"));
        }

        Reply::lines(lines)
    }

    /// Snapshot the mailbox: sequence numbers follow the store's internal
    /// date order, UIDs continue from the session counter.
    fn load_messages(&mut self, mailbox: &str) {
        self.messages.clear();
        self.uid_to_seq.clear();

        let maildir = self.maildir.as_ref().unwrap();
        for (ix, message) in
            maildir.list_messages(mailbox).into_iter().enumerate()
        {
            let seq = (ix + 1) as u32;
            let uid = self.next_uid;
            self.next_uid += 1;

            self.uid_to_seq.insert(uid, seq);
            self.messages.push(CachedMessage {
                seq,
                uid,
                unique_id: message.unique_id,
                size: message.size,
                flags: message.flags,
                recent: message.is_new,
                internal_date: message.internal_date,
            });
        }
    }

    fn cmd_create(&mut self, tag: &str, args: &str) -> Reply {
        if let Some(error) = self.require_authenticated(tag) {
            return error;
        }

        let mut pos = 0;
        let Some(mailbox) = syntax::parse_string(args, &mut pos) else {
            return Reply::one(response::bad(tag, "Mailbox name required"));
        };

        match self.maildir.as_ref().unwrap().create_mailbox(&mailbox) {
            Ok(()) => Reply::one(response::ok(tag, "CREATE completed")),
            Err(e) => {
                warn!("{} CREATE {mailbox}: {e}", self.params.log_prefix);
                Reply::one(response::no(tag, "Failed to create mailbox"))
            },
        }
    }

    fn cmd_delete(&mut self, tag: &str, args: &str) -> Reply {
        if let Some(error) = self.require_authenticated(tag) {
            return error;
        }

        let mut pos = 0;
        let Some(mailbox) = syntax::parse_string(args, &mut pos) else {
            return Reply::one(response::bad(tag, "Mailbox name required"));
        };

        match self.maildir.as_ref().unwrap().delete_mailbox(&mailbox) {
            Ok(()) => Reply::one(response::ok(tag, "DELETE completed")),
            Err(e) => {
                warn!("{} DELETE {mailbox}: {e}", self.params.log_prefix);
                Reply::one(response::no(tag, "Failed to delete mailbox"))
            },
        }
    }

    fn cmd_rename(&mut self, tag: &str, args: &str) -> Reply {
        if let Some(error) = self.require_authenticated(tag) {
            return error;
        }

        let mut pos = 0;
        let old_name = syntax::parse_string(args, &mut pos);
        let new_name = syntax::parse_string(args, &mut pos);
        let (Some(old_name), Some(new_name)) = (old_name, new_name) else {
            return Reply::one(response::bad(
                tag,
                "Usage: RENAME old-name new-name",
            ));
        };

        match self
            .maildir
            .as_ref()
            .unwrap()
            .rename_mailbox(&old_name, &new_name)
        {
            Ok(()) => Reply::one(response::ok(tag, "RENAME completed")),
            Err(e) => {
                warn!(
                    "{} RENAME {old_name} {new_name}: {e}",
                    self.params.log_prefix,
                );
                Reply::one(response::no(tag, "Failed to rename mailbox"))
            },
        }
    }

    fn cmd_list(&mut self, tag: &str, args: &str, lsub: bool) -> Reply {
        if let Some(error) = self.require_authenticated(tag) {
            return error;
        }

        let mut pos = 0;
        let _reference = syntax::parse_string(args, &mut pos);
        let pattern = syntax::parse_string(args, &mut pos)
            .unwrap_or_else(|| "*".to_owned());

        let token = if lsub { "LSUB" } else { "LIST" };
        let mut lines = Vec::new();
        for mailbox in
            self.maildir.as_ref().unwrap().list_mailboxes(&pattern)
        {
            let flags = if "INBOX" == mailbox {
                "(\\HasNoChildren)"
            } else {
                "()"
            };
            lines.push(response::untagged(&format!(
                "{} {} \"/\" {}",
                token,
                flags,
                syntax::quote_string(&mailbox),
            )));
        }

        lines.push(response::ok(tag, &format!("{} completed", token)));
        Reply::lines(lines)
    }

    fn cmd_status(&mut self, tag: &str, args: &str) -> Reply {
        if let Some(error) = self.require_authenticated(tag) {
            return error;
        }

        let mut pos = 0;
        let Some(mailbox) = syntax::parse_string(args, &mut pos) else {
            return Reply::one(response::bad(tag, "Mailbox name required"));
        };

        match self.maildir.as_ref().unwrap().get_mailbox_info(&mailbox) {
            Ok(info) => Reply::lines(vec![
                response::untagged(&format!(
                    "STATUS {} (MESSAGES {} RECENT {} UNSEEN {} \
                     UIDVALIDITY {} UIDNEXT {})",
                    syntax::quote_string(&mailbox),
                    info.total,
                    info.recent,
                    info.unseen,
                    info.uid_validity,
                    info.uid_next,
                )),
                response::ok(tag, "STATUS completed"),
            ]),
            Err(_) => {
                Reply::one(response::no(tag, "Mailbox does not exist"))
            },
        }
    }

    fn cmd_close(&mut self, tag: &str) -> Reply {
        if let Some(error) = self.require_selected(tag) {
            return error;
        }

        // Implicit expunge, without untagged responses. A mailbox opened
        // with EXAMINE must not lose messages on CLOSE.
        let selected = self.selected.take().unwrap();
        if !selected.read_only {
            if let Err(e) =
                self.maildir.as_ref().unwrap().expunge(&selected.name)
            {
                warn!(
                    "{} Implicit expunge of {} failed: {e}",
                    self.params.log_prefix, selected.name,
                );
            }
        }

        self.messages.clear();
        self.uid_to_seq.clear();
        self.state = State::Authenticated;
        Reply::one(response::ok(tag, "CLOSE completed"))
    }

    fn cmd_expunge(&mut self, tag: &str) -> Reply {
        if let Some(error) = self.require_selected(tag) {
            return error;
        }

        let name = self.selected.as_ref().unwrap().name.clone();
        let maildir = self.maildir.as_ref().unwrap();

        // Unlink in descending order so an interrupted pass cannot shift
        // the sequence numbers of entries yet to be visited
        let doomed = self
            .messages
            .iter()
            .rev()
            .filter(|m| m.flags.contains(&Flag::Deleted))
            .map(|m| (m.seq, m.unique_id.clone()))
            .collect::<Vec<_>>();

        for (_, unique_id) in &doomed {
            if let Err(e) = maildir.delete_message(&name, unique_id) {
                warn!(
                    "{} EXPUNGE failed to delete {unique_id}: {e}",
                    self.params.log_prefix,
                );
            }
        }

        // Report in ascending order of the original sequence numbers
        let mut lines = doomed
            .iter()
            .rev()
            .map(|&(seq, _)| {
                response::untagged(&format!("{} EXPUNGE", seq))
            })
            .collect::<Vec<_>>();

        // Renumber the survivors; their UIDs are untouched
        self.messages.retain(|m| !m.flags.contains(&Flag::Deleted));
        self.uid_to_seq.clear();
        for (ix, message) in self.messages.iter_mut().enumerate() {
            message.seq = (ix + 1) as u32;
            self.uid_to_seq.insert(message.uid, message.seq);
        }

        let unseen = self
            .messages
            .iter()
            .filter(|m| !m.flags.contains(&Flag::Seen))
            .count();
        self.selected.as_mut().unwrap().unseen = unseen;

        lines.push(response::ok(tag, "EXPUNGE completed"));
        Reply::lines(lines)
    }

    fn cmd_search(&mut self, tag: &str, args: &str, uid_mode: bool) -> Reply {
        if let Some(error) = self.require_selected(tag) {
            return error;
        }

        let criteria = syntax::parse_search_criteria(args);

        let mut result = String::from("SEARCH");
        for message in &self.messages {
            let matches = criteria
                .iter()
                .all(|key| search_key_matches(message, key));
            if matches {
                let key =
                    if uid_mode { message.uid } else { message.seq };
                result.push(' ');
                result.push_str(&key.to_string());
            }
        }

        Reply::lines(vec![
            response::untagged(&result),
            response::ok(tag, "SEARCH completed"),
        ])
    }

    fn cmd_fetch(&mut self, tag: &str, args: &str, uid_mode: bool) -> Reply {
        if let Some(error) = self.require_selected(tag) {
            return error;
        }

        let (set_text, item_text) = match args.split_once(' ') {
            Some((set_text, item_text)) => (set_text, item_text),
            None => (args, ""),
        };

        let Some(set) = syntax::SequenceSet::parse(set_text) else {
            return Reply::one(response::bad(tag, "Invalid sequence set"));
        };

        let mut items = syntax::parse_fetch_items(item_text);
        // A UID FETCH response always carries the UID, requested or not
        if uid_mode
            && !items.iter().any(|i| FetchItemKind::Uid == i.kind)
        {
            items.insert(
                0,
                syntax::FetchItem {
                    kind: FetchItemKind::Uid,
                    section: None,
                },
            );
        }

        let mut lines = Vec::new();
        for ix in 0..self.messages.len() {
            let key = if uid_mode {
                self.messages[ix].uid
            } else {
                self.messages[ix].seq
            };
            if !set.contains(key) {
                continue;
            }

            lines.push(self.fetch_message(ix, &items));
        }

        lines.push(response::ok(tag, "FETCH completed"));
        Reply::lines(lines)
    }

    /// Build the untagged FETCH response for one message.
    fn fetch_message(
        &mut self,
        ix: usize,
        items: &[syntax::FetchItem],
    ) -> Vec<u8> {
        let mailbox = self.selected.as_ref().unwrap().name.clone();

        let mut line = Vec::<u8>::new();
        line.extend_from_slice(
            format!("* {} FETCH (", self.messages[ix].seq).as_bytes(),
        );

        let mut first = true;
        for item in items {
            let mut rendered = Vec::<u8>::new();

            match item.kind {
                FetchItemKind::Flags => {
                    rendered.extend_from_slice(
                        format!(
                            "FLAGS {}",
                            self.format_message_flags(ix)
                        )
                        .as_bytes(),
                    );
                },

                FetchItemKind::Uid => {
                    rendered.extend_from_slice(
                        format!("UID {}", self.messages[ix].uid).as_bytes(),
                    );
                },

                FetchItemKind::Rfc822Size => {
                    rendered.extend_from_slice(
                        format!("RFC822.SIZE {}", self.messages[ix].size)
                            .as_bytes(),
                    );
                },

                FetchItemKind::InternalDate => {
                    rendered.extend_from_slice(
                        format!(
                            "INTERNALDATE {}",
                            syntax::format_internal_date(
                                self.messages[ix].internal_date
                            )
                        )
                        .as_bytes(),
                    );
                },

                FetchItemKind::Rfc822
                | FetchItemKind::Body
                | FetchItemKind::BodyPeek => {
                    let section =
                        item.section.as_deref().unwrap_or("");
                    let header_only = "HEADER" == section;
                    if !section.is_empty() && !header_only {
                        // Subsection fetches need full MIME parsing
                        continue;
                    }

                    let maildir = self.maildir.as_ref().unwrap();
                    let unique_id = &self.messages[ix].unique_id;
                    let content = if header_only {
                        maildir.get_message_headers(&mailbox, unique_id)
                    } else {
                        maildir.get_message_content(&mailbox, unique_id)
                    };
                    let Ok(content) = content else { continue };

                    let item_name = if header_only {
                        "BODY[HEADER]"
                    } else {
                        "BODY[]"
                    };
                    rendered.extend_from_slice(
                        format!("{} {{{}}}\r\n", item_name, content.len())
                            .as_bytes(),
                    );
                    rendered.extend_from_slice(&content);

                    if FetchItemKind::BodyPeek != item.kind {
                        self.mark_seen(ix, &mailbox);
                    }
                },

                FetchItemKind::Rfc822Header => {
                    let maildir = self.maildir.as_ref().unwrap();
                    let Ok(content) = maildir.get_message_headers(
                        &mailbox,
                        &self.messages[ix].unique_id,
                    ) else {
                        continue;
                    };

                    rendered.extend_from_slice(
                        format!("RFC822.HEADER {{{}}}\r\n", content.len())
                            .as_bytes(),
                    );
                    rendered.extend_from_slice(&content);
                },

                // Macros and structure items would need MIME parsing;
                // they parse but render nothing
                FetchItemKind::All
                | FetchItemKind::Fast
                | FetchItemKind::Full
                | FetchItemKind::Envelope
                | FetchItemKind::BodyStructure
                | FetchItemKind::Rfc822Text => continue,
            }

            if !first {
                line.push(b' ');
            }
            first = false;
            line.append(&mut rendered);
        }

        line.push(b')');
        line
    }

    /// Add `\Seen` as a side effect of a non-peek body fetch.
    fn mark_seen(&mut self, ix: usize, mailbox: &str) {
        if self.messages[ix].flags.contains(&Flag::Seen) {
            return;
        }

        let mut seen = FlagSet::new();
        seen.insert(Flag::Seen);
        if let Err(e) = self.maildir.as_ref().unwrap().add_flags(
            mailbox,
            &self.messages[ix].unique_id,
            &seen,
        ) {
            warn!(
                "{} Failed to mark {} seen: {e}",
                self.params.log_prefix, self.messages[ix].unique_id,
            );
            return;
        }

        self.messages[ix].flags.insert(Flag::Seen);
        if let Some(ref mut selected) = self.selected {
            selected.unseen = selected.unseen.saturating_sub(1);
        }
    }

    fn format_message_flags(&self, ix: usize) -> String {
        let message = &self.messages[ix];
        let mut names = message
            .flags
            .iter()
            .map(|f| f.name())
            .collect::<Vec<_>>();
        if message.recent {
            names.push("\\Recent");
        }
        syntax::format_flags(names)
    }

    fn cmd_store(&mut self, tag: &str, args: &str, uid_mode: bool) -> Reply {
        if let Some(error) = self.require_selected(tag) {
            return error;
        }

        let (set_text, action_text) = match args.split_once(' ') {
            Some((set_text, action_text)) => (set_text, action_text),
            None => (args, ""),
        };

        let Some(set) = syntax::SequenceSet::parse(set_text) else {
            return Reply::one(response::bad(tag, "Invalid sequence set"));
        };

        let Some(action) = syntax::parse_store_action(action_text) else {
            return Reply::one(response::bad(tag, "Invalid STORE action"));
        };

        // Unknown flags and keywords are dropped; only the five system
        // flags are persistable
        let action_flags = action
            .flags
            .iter()
            .filter_map(|name| Flag::from_imap_name(name))
            .collect::<FlagSet>();

        let mailbox = self.selected.as_ref().unwrap().name.clone();
        let mut lines = Vec::new();

        for ix in 0..self.messages.len() {
            let key = if uid_mode {
                self.messages[ix].uid
            } else {
                self.messages[ix].seq
            };
            if !set.contains(key) {
                continue;
            }

            let new_flags: FlagSet = match action.kind {
                StoreActionKind::Replace => action_flags.clone(),
                StoreActionKind::Add => self.messages[ix]
                    .flags
                    .union(&action_flags)
                    .copied()
                    .collect(),
                StoreActionKind::Remove => self.messages[ix]
                    .flags
                    .difference(&action_flags)
                    .copied()
                    .collect(),
            };

            if let Err(e) = self.maildir.as_ref().unwrap().set_flags(
                &mailbox,
                &self.messages[ix].unique_id,
                &new_flags,
            ) {
                warn!(
                    "{} STORE failed on {}: {e}",
                    self.params.log_prefix, self.messages[ix].unique_id,
                );
                lines.push(response::no(tag, "STORE failed"));
                return Reply::lines(lines);
            }

            self.messages[ix].flags = new_flags;

            if !action.silent {
                lines.push(response::untagged(&format!(
                    "{} FETCH (FLAGS {})",
                    self.messages[ix].seq,
                    self.format_message_flags(ix),
                )));
            }
        }

        let unseen = self
            .messages
            .iter()
            .filter(|m| !m.flags.contains(&Flag::Seen))
            .count();
        self.selected.as_mut().unwrap().unseen = unseen;

        lines.push(response::ok(tag, "STORE completed"));
        Reply::lines(lines)
    }

    fn cmd_copy(&mut self, tag: &str, args: &str, uid_mode: bool) -> Reply {
        if let Some(error) = self.require_selected(tag) {
            return error;
        }

        let mut pos = 0;
        let set_text = syntax::parse_atom(args, &mut pos);
        let target = syntax::parse_string(args, &mut pos);
        let (Some(set_text), Some(target)) = (set_text, target) else {
            return Reply::one(response::bad(
                tag,
                "Usage: COPY sequence-set mailbox",
            ));
        };

        let Some(set) = syntax::SequenceSet::parse(&set_text) else {
            return Reply::one(response::bad(tag, "Invalid sequence set"));
        };

        let mailbox = self.selected.as_ref().unwrap().name.clone();
        let maildir = self.maildir.as_ref().unwrap();

        for message in &self.messages {
            let key = if uid_mode { message.uid } else { message.seq };
            if !set.contains(key) {
                continue;
            }

            if let Err(e) =
                maildir.copy_message(&mailbox, &target, &message.unique_id)
            {
                // Copies already made stay where they are
                warn!(
                    "{} COPY {} to {target} failed: {e}",
                    self.params.log_prefix, message.unique_id,
                );
                return Reply::one(response::no(tag, "COPY failed"));
            }
        }

        Reply::one(response::ok(tag, "COPY completed"))
    }

    fn cmd_uid(&mut self, tag: &str, args: &str) -> Reply {
        if let Some(error) = self.require_selected(tag) {
            return error;
        }

        let (sub_command, sub_args) = match args.split_once(' ') {
            Some((sub_command, sub_args)) => (sub_command, sub_args),
            None => (args, ""),
        };

        match sub_command.to_ascii_uppercase().as_str() {
            "SEARCH" => self.cmd_search(tag, sub_args, true),
            "FETCH" => self.cmd_fetch(tag, sub_args, true),
            "STORE" => self.cmd_store(tag, sub_args, true),
            "COPY" => self.cmd_copy(tag, sub_args, true),
            _ => Reply::one(response::bad(tag, "Unknown UID command")),
        }
    }

    #[cfg(test)]
    fn seq_for_uid(&self, uid: u32) -> Option<u32> {
        self.uid_to_seq.get(&uid).copied()
    }
}

fn search_key_matches(
    message: &CachedMessage,
    key: &syntax::SearchKey,
) -> bool {
    use self::SearchKeyKind::*;

    let has = |flag: Flag| message.flags.contains(&flag);

    match key.kind {
        All => true,
        Answered => has(Flag::Answered),
        Unanswered => !has(Flag::Answered),
        Deleted => has(Flag::Deleted),
        Undeleted => !has(Flag::Deleted),
        Draft => has(Flag::Draft),
        Undraft => !has(Flag::Draft),
        Flagged => has(Flag::Flagged),
        Unflagged => !has(Flag::Flagged),
        Seen => has(Flag::Seen),
        Unseen => !has(Flag::Seen),
        Recent => message.recent,
        New => message.recent && !has(Flag::Seen),
        Old => !message.recent,

        Larger => key
            .value
            .parse::<u64>()
            .map_or(true, |n| message.size > n),
        Smaller => key
            .value
            .parse::<u64>()
            .map_or(true, |n| message.size < n),

        Uid => syntax::SequenceSet::parse(&key.value)
            .map_or(true, |set| set.contains(message.uid)),

        // Content and date scans, plus the boolean connectives, are
        // accepted but do not constrain the result
        From | To | Cc | Bcc | Subject | Body | Text | Before | On
        | Since | Not | Or => true,
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::account::model::Flag;

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
            log_prefix: LogPrefix::new("imap:test".to_owned()),
            store: Arc::clone(&setup.store),
            maildir_root: setup.maildir_root.clone(),
            host_name: "mail.earth.example".to_owned(),
            starttls_available: true,
            tls_active: false,
        })
    }

    fn text_lines(reply: &Reply) -> Vec<String> {
        reply
            .lines
            .iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect()
    }

    fn run(session: &mut Session, input: &str) -> Vec<String> {
        let reply = session.on_line(input);
        assert_matches!(Event::None, reply.event);
        text_lines(&reply)
    }

    fn expect_tagged(
        session: &mut Session,
        input: &str,
        expected_last: &str,
    ) -> Vec<String> {
        let lines = run(session, input);
        let last = lines.last().unwrap();
        assert!(
            last.starts_with(expected_last),
            "for {input:?} expected last line {expected_last:?}, \
             got {lines:?}"
        );
        lines
    }

    fn log_in(session: &mut Session) {
        expect_tagged(
            session,
            "A LOGIN dib@earth.example hunter2",
            "A OK LOGIN completed",
        );
    }

    #[test]
    fn login_and_capabilities() {
        let setup = set_up();
        let mut session = session(&setup);

        assert_eq!(
            "* OK mail.earth.example IMAP4rev1 Service Ready",
            session.greeting()
        );

        let lines = run(&mut session, "A1 CAPABILITY");
        assert_eq!(
            "* CAPABILITY IMAP4rev1 AUTH=PLAIN AUTH=LOGIN STARTTLS",
            lines[0]
        );
        assert_eq!("A1 OK CAPABILITY completed", lines[1]);

        // Commands requiring authentication are rejected
        expect_tagged(&mut session, "A2 LIST \"\" *", "A2 BAD");
        expect_tagged(&mut session, "A3 SELECT INBOX", "A3 BAD");

        expect_tagged(
            &mut session,
            "A4 LOGIN dib@earth.example wrong",
            "A4 NO [AUTHENTICATIONFAILED] Authentication failed",
        );

        log_in(&mut session);

        let lines = run(&mut session, "A5 CAPABILITY");
        assert_eq!(
            "* CAPABILITY IMAP4rev1 AUTH=PLAIN AUTH=LOGIN STARTTLS \
             CHILDREN NAMESPACE",
            lines[0]
        );

        expect_tagged(
            &mut session,
            "A6 LOGIN dib@earth.example hunter2",
            "A6 BAD Already authenticated",
        );
    }

    #[test]
    fn quoted_login_arguments() {
        let setup = set_up();
        let mut session = session(&setup);
        expect_tagged(
            &mut session,
            "A LOGIN \"dib@earth.example\" \"hunter2\"",
            "A OK LOGIN completed",
        );
    }

    #[test]
    fn authenticate_plain() {
        let setup = set_up();
        let mut session = session(&setup);

        let lines = run(&mut session, "A AUTHENTICATE PLAIN");
        assert_eq!(vec!["+ ".to_owned()], lines);

        let blob = base64::encode("\0dib@earth.example\0hunter2");
        expect_tagged(&mut session, &blob, "A OK AUTHENTICATE completed");
    }

    #[test]
    fn authenticate_login_and_abort() {
        let setup = set_up();
        let mut session = session(&setup);

        let lines = run(&mut session, "A AUTHENTICATE LOGIN");
        assert_eq!(
            vec![format!("+ {}", base64::encode("Username:"))],
            lines
        );
        let lines = run(&mut session, &base64::encode("dib@earth.example"));
        assert_eq!(
            vec![format!("+ {}", base64::encode("Password:"))],
            lines
        );
        expect_tagged(
            &mut session,
            &base64::encode("hunter2"),
            "A OK AUTHENTICATE completed",
        );

        // Abort flow
        let mut session2 = self::session(&setup);
        run(&mut session2, "B AUTHENTICATE PLAIN");
        expect_tagged(&mut session2, "*", "B BAD AUTHENTICATE aborted");
        // Back to command parsing
        expect_tagged(&mut session2, "C NOOP", "C OK NOOP completed");
    }

    #[test]
    fn select_responses() {
        let setup = set_up();
        // One message of exactly 42 bytes
        let content = vec![b'x'; 42];
        setup.maildir.deliver("INBOX", &content).unwrap();

        let mut session = session(&setup);
        log_in(&mut session);

        let validity = setup.maildir.get_uid_validity("INBOX").unwrap();
        let lines = run(&mut session, "A SELECT INBOX");
        assert_eq!(
            vec![
                "* 1 EXISTS".to_owned(),
                "* 1 RECENT".to_owned(),
                "* OK [UNSEEN 1]".to_owned(),
                format!("* OK [UIDVALIDITY {}]", validity),
                "* OK [UIDNEXT 2]".to_owned(),
                format!("* FLAGS {}", MAILBOX_FLAGS),
                format!("* OK [PERMANENTFLAGS {}]", PERMANENT_FLAGS),
                "A OK [READ-WRITE] SELECT completed".to_owned(),
            ],
            lines
        );

        expect_tagged(
            &mut session,
            "B SELECT NoSuchBox",
            "B NO Mailbox does not exist",
        );
    }

    #[test]
    fn examine_is_read_only() {
        let setup = set_up();
        setup.maildir.deliver("INBOX", b"m").unwrap();

        let mut session = session(&setup);
        log_in(&mut session);

        let lines = run(&mut session, "A EXAMINE INBOX");
        assert_eq!("* 1 EXISTS", lines[0]);
        assert_eq!("* 1 RECENT", lines[1]);
        assert_eq!(format!("* FLAGS {}", MAILBOX_FLAGS), lines[2]);
        assert_eq!("A OK [READ-ONLY] EXAMINE completed", lines[3]);

        // Closing a read-only mailbox does not expunge
        run(&mut session, "B STORE 1 +FLAGS.SILENT (\\Deleted)");
        run(&mut session, "C CLOSE");
        assert_eq!(1, setup.maildir.list_messages("INBOX").len());
    }

    #[test]
    fn fetch_static_items() {
        let setup = set_up();
        let content = vec![b'x'; 42];
        setup.maildir.deliver("INBOX", &content).unwrap();

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        let lines = run(&mut session, "B FETCH 1 (UID FLAGS RFC822.SIZE)");
        assert_eq!(
            "* 1 FETCH (UID 1 FLAGS (\\Recent) RFC822.SIZE 42)",
            lines[0]
        );
        assert_eq!("B OK FETCH completed", lines[1]);

        let lines = run(&mut session, "C FETCH 1 INTERNALDATE");
        assert!(lines[0].starts_with("* 1 FETCH (INTERNALDATE \""));

        // Out-of-range sequence matches nothing
        let lines = run(&mut session, "D FETCH 5 FLAGS");
        assert_eq!(vec!["D OK FETCH completed".to_owned()], lines);

        expect_tagged(&mut session, "E FETCH x FLAGS", "E BAD");
    }

    #[test]
    fn fetch_body_emits_literal_and_marks_seen() {
        let setup = set_up();
        let content = b"Subject: hi\r\n\r\nbody\r\n";
        let unique_id = setup.maildir.deliver("INBOX", content).unwrap();

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        // PEEK does not set \Seen
        let reply = session.on_line("B FETCH 1 BODY.PEEK[]");
        let expected = format!("* 1 FETCH (BODY[] {{{}}}\r\n", content.len());
        let mut expected = expected.into_bytes();
        expected.extend_from_slice(content);
        expected.push(b')');
        assert_eq!(expected, reply.lines[0]);

        let message = setup.maildir.get_message("INBOX", &unique_id).unwrap();
        assert!(!message.flags.contains(&Flag::Seen));

        // A plain BODY[] fetch sets it, exactly once
        let reply = session.on_line("C FETCH 1 BODY[]");
        assert_eq!(expected, reply.lines[0]);

        let message = setup.maildir.get_message("INBOX", &unique_id).unwrap();
        assert!(message.flags.contains(&Flag::Seen));
        assert!(!message.is_new);

        let lines = run(&mut session, "D FETCH 1 FLAGS");
        assert_eq!("* 1 FETCH (FLAGS (\\Seen \\Recent))", lines[0]);

        // Fetching again does not toggle anything
        session.on_line("E FETCH 1 BODY[]");
        let message = setup.maildir.get_message("INBOX", &unique_id).unwrap();
        assert_eq!(1, message.flags.len());
    }

    #[test]
    fn fetch_headers() {
        let setup = set_up();
        let content = b"A: 1\r\nB: 2\r\n\r\nbody\r\n";
        setup.maildir.deliver("INBOX", content).unwrap();

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        let reply = session.on_line("B FETCH 1 RFC822.HEADER");
        let text = String::from_utf8_lossy(&reply.lines[0]).into_owned();
        assert!(text.starts_with("* 1 FETCH (RFC822.HEADER {10}\r\n"));
        assert!(text.contains("A: 1\r\nB: 2"));

        let reply = session.on_line("C FETCH 1 BODY.PEEK[HEADER]");
        let text = String::from_utf8_lossy(&reply.lines[0]).into_owned();
        assert!(text.starts_with("* 1 FETCH (BODY[HEADER] {10}\r\n"));
    }

    #[test]
    fn store_and_flag_round_trip() {
        let setup = set_up();
        let unique_id = setup.maildir.deliver("INBOX", b"m").unwrap();

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        let lines =
            run(&mut session, "B STORE 1 +FLAGS (\\Seen)");
        assert_eq!("* 1 FETCH (FLAGS (\\Seen \\Recent))", lines[0]);
        assert_eq!("B OK STORE completed", lines[1]);

        // The file was renamed into cur/ with the flag suffix
        let message = setup.maildir.get_message("INBOX", &unique_id).unwrap();
        assert!(message.path.ends_with(format!("cur/{}:2,S", unique_id)));

        // The in-memory set equals the re-parsed filename flags
        let lines = run(&mut session, "C FETCH 1 FLAGS");
        assert_eq!("* 1 FETCH (FLAGS (\\Seen \\Recent))", lines[0]);

        let lines =
            run(&mut session, "D STORE 1 +FLAGS (\\Flagged \\Answered)");
        assert_eq!(
            "* 1 FETCH (FLAGS (\\Answered \\Flagged \\Seen \\Recent))",
            lines[0]
        );
        let message = setup.maildir.get_message("INBOX", &unique_id).unwrap();
        assert!(message.path.ends_with(format!("cur/{}:2,FRS", unique_id)));

        let lines = run(&mut session, "E STORE 1 -FLAGS (\\Seen)");
        assert_eq!(
            "* 1 FETCH (FLAGS (\\Answered \\Flagged \\Recent))",
            lines[0]
        );

        let lines = run(&mut session, "F STORE 1 FLAGS (\\Draft)");
        assert_eq!("* 1 FETCH (FLAGS (\\Draft \\Recent))", lines[0]);

        // Silent variant emits no untagged response
        let lines = run(&mut session, "G STORE 1 +FLAGS.SILENT (\\Deleted)");
        assert_eq!(vec!["G OK STORE completed".to_owned()], lines);

        let message = setup.maildir.get_message("INBOX", &unique_id).unwrap();
        assert_eq!(
            vec![Flag::Deleted, Flag::Draft],
            message.flags.iter().copied().collect::<Vec<_>>()
        );
    }

    #[test]
    fn expunge_renumbers_and_keeps_uids() {
        let setup = set_up();
        for i in 0..4 {
            setup
                .maildir
                .deliver("INBOX", format!("message {}", i).as_bytes())
                .unwrap();
        }

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        run(&mut session, "B STORE 1,3 +FLAGS.SILENT (\\Deleted)");

        let lines = run(&mut session, "C EXPUNGE");
        assert_eq!(
            vec![
                "* 1 EXPUNGE".to_owned(),
                "* 3 EXPUNGE".to_owned(),
                "C OK EXPUNGE completed".to_owned(),
            ],
            lines
        );

        // Survivors: originally seq 2 (uid 2) and seq 4 (uid 4); their
        // sequence numbers shift down but their UIDs are unchanged
        let lines = run(&mut session, "D FETCH 1:* (UID)");
        assert_eq!("* 1 FETCH (UID 2)", lines[0]);
        assert_eq!("* 2 FETCH (UID 4)", lines[1]);
        assert_eq!(Some(1), session.seq_for_uid(2));
        assert_eq!(Some(2), session.seq_for_uid(4));

        assert_eq!(2, setup.maildir.list_messages("INBOX").len());

        // Nothing left to expunge
        let lines = run(&mut session, "E EXPUNGE");
        assert_eq!(vec!["E OK EXPUNGE completed".to_owned()], lines);
    }

    #[test]
    fn search_criteria() {
        let setup = set_up();
        let small = setup.maildir.deliver("INBOX", &[b'a'; 10]).unwrap();
        let _large = setup.maildir.deliver("INBOX", &[b'b'; 1000]).unwrap();

        // Mark the small message seen (also clears its \Recent by moving
        // it to cur/) before the session snapshots the mailbox
        let mut seen = FlagSet::new();
        seen.insert(Flag::Seen);
        setup.maildir.set_flags("INBOX", &small, &seen).unwrap();

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        // Sequence 1 = small/seen/old, sequence 2 = large/unseen/recent
        assert_eq!(
            "* SEARCH 1 2",
            run(&mut session, "B SEARCH ALL")[0]
        );
        assert_eq!(
            "* SEARCH 1",
            run(&mut session, "C SEARCH SEEN")[0]
        );
        assert_eq!(
            "* SEARCH 2",
            run(&mut session, "D SEARCH UNSEEN")[0]
        );
        assert_eq!(
            "* SEARCH 2",
            run(&mut session, "E SEARCH LARGER 100")[0]
        );
        assert_eq!(
            "* SEARCH 1",
            run(&mut session, "F SEARCH SMALLER 100")[0]
        );
        assert_eq!(
            "* SEARCH 2",
            run(&mut session, "G SEARCH NEW")[0]
        );
        assert_eq!(
            "* SEARCH 1",
            run(&mut session, "H SEARCH OLD")[0]
        );
        assert_eq!(
            "* SEARCH 1",
            run(&mut session, "I SEARCH UID 1")[0]
        );
        // Conjunction of multiple criteria
        assert_eq!(
            "* SEARCH 2",
            run(&mut session, "J SEARCH UNSEEN LARGER 100")[0]
        );
        assert_eq!(
            "* SEARCH",
            run(&mut session, "K SEARCH SEEN LARGER 100")[0]
        );
        // Content criteria are no-op matches
        assert_eq!(
            "* SEARCH 1 2",
            run(&mut session, "L SEARCH FROM zim")[0]
        );
    }

    #[test]
    fn uid_commands() {
        let setup = set_up();
        for i in 0..3 {
            setup
                .maildir
                .deliver("INBOX", format!("message {}", i).as_bytes())
                .unwrap();
        }

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        assert_eq!(
            "* SEARCH 1 2 3",
            run(&mut session, "B UID SEARCH ALL")[0]
        );

        // UID FETCH includes the UID item even when not requested
        let lines = run(&mut session, "C UID FETCH 2 FLAGS");
        assert_eq!("* 2 FETCH (UID 2 FLAGS (\\Recent))", lines[0]);

        let lines = run(&mut session, "D UID FETCH 2:* (UID)");
        assert_eq!("* 2 FETCH (UID 2)", lines[0]);
        assert_eq!("* 3 FETCH (UID 3)", lines[1]);

        let lines = run(&mut session, "E UID STORE 3 +FLAGS (\\Seen)");
        assert_eq!("* 3 FETCH (FLAGS (\\Seen \\Recent))", lines[0]);

        expect_tagged(
            &mut session,
            "F UID COPY 1 Sent",
            "F OK COPY completed",
        );
        assert_eq!(1, setup.maildir.list_messages("Sent").len());

        expect_tagged(&mut session, "G UID BOGUS 1", "G BAD");
    }

    #[test]
    fn copy_to_new_mailbox() {
        let setup = set_up();
        setup.maildir.deliver("INBOX", b"one").unwrap();
        setup.maildir.deliver("INBOX", b"two").unwrap();

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");

        expect_tagged(
            &mut session,
            "B COPY 1:2 Archive",
            "B OK COPY completed",
        );
        assert_eq!(2, setup.maildir.list_messages("Archive").len());
        // Copies get fresh unique ids; the originals stay put
        assert_eq!(2, setup.maildir.list_messages("INBOX").len());
    }

    #[test]
    fn close_performs_implicit_expunge() {
        let setup = set_up();
        setup.maildir.deliver("INBOX", b"doomed").unwrap();
        setup.maildir.deliver("INBOX", b"kept").unwrap();

        let mut session = session(&setup);
        log_in(&mut session);
        run(&mut session, "A SELECT INBOX");
        run(&mut session, "B STORE 1 +FLAGS.SILENT (\\Deleted)");

        let lines = run(&mut session, "C CLOSE");
        assert_eq!(vec!["C OK CLOSE completed".to_owned()], lines);
        assert_eq!(1, setup.maildir.list_messages("INBOX").len());

        // Back in the authenticated state
        expect_tagged(&mut session, "D FETCH 1 FLAGS", "D BAD");
        expect_tagged(&mut session, "E CHECK", "E BAD");
        expect_tagged(&mut session, "F SELECT INBOX", "F OK");
    }

    #[test]
    fn mailbox_management() {
        let setup = set_up();
        let mut session = session(&setup);
        log_in(&mut session);

        expect_tagged(&mut session, "A CREATE Projects/Tridove", "A OK");
        let lines = run(&mut session, "B LIST \"\" *");
        assert!(lines.contains(
            &"* LIST () \"/\" Projects/Tridove".to_owned()
        ));
        assert!(lines
            .contains(&"* LIST (\\HasNoChildren) \"/\" INBOX".to_owned()));

        // LSUB aliases LIST
        let lines = run(&mut session, "C LSUB \"\" *");
        assert!(lines.contains(&"* LSUB () \"/\" Sent".to_owned()));
        assert_eq!("C OK LSUB completed", lines.last().unwrap());

        expect_tagged(
            &mut session,
            "D RENAME Projects/Tridove Archive",
            "D OK",
        );
        let lines = run(&mut session, "E LIST \"\" *");
        assert!(!lines.iter().any(|l| l.contains("Projects")));
        assert!(lines.contains(&"* LIST () \"/\" Archive".to_owned()));

        expect_tagged(&mut session, "F DELETE Archive", "F OK");
        expect_tagged(&mut session, "G DELETE Archive", "G NO");
        expect_tagged(&mut session, "H DELETE INBOX", "H NO");

        expect_tagged(&mut session, "I SUBSCRIBE Sent", "I OK");
        expect_tagged(&mut session, "J UNSUBSCRIBE Sent", "J OK");

        // Quoted names with spaces
        expect_tagged(&mut session, "K CREATE \"My Folder\"", "K OK");
        let lines = run(&mut session, "L LIST \"\" *");
        assert!(lines.contains(&"* LIST () \"/\" \"My Folder\"".to_owned()));
    }

    #[test]
    fn status_reports_counts() {
        let setup = set_up();
        let seen = setup.maildir.deliver("INBOX", b"aaaa").unwrap();
        setup.maildir.deliver("INBOX", b"bb").unwrap();

        let mut flags = FlagSet::new();
        flags.insert(Flag::Seen);
        setup.maildir.set_flags("INBOX", &seen, &flags).unwrap();

        let mut session = session(&setup);
        log_in(&mut session);

        let validity = setup.maildir.get_uid_validity("INBOX").unwrap();
        let lines = run(&mut session, "A STATUS INBOX (MESSAGES UNSEEN)");
        assert_eq!(
            format!(
                "* STATUS INBOX (MESSAGES 2 RECENT 1 UNSEEN 1 \
                 UIDVALIDITY {} UIDNEXT 1)",
                validity
            ),
            lines[0]
        );
        assert_eq!("A OK STATUS completed", lines[1]);

        expect_tagged(&mut session, "B STATUS NoSuch (MESSAGES)", "B NO");
    }

    #[test]
    fn reselect_never_reuses_uids() {
        let setup = set_up();
        setup.maildir.deliver("INBOX", b"one").unwrap();
        setup.maildir.deliver("INBOX", b"two").unwrap();

        let mut session = session(&setup);
        log_in(&mut session);

        run(&mut session, "A SELECT INBOX");
        let lines = run(&mut session, "B FETCH 1:* (UID)");
        assert_eq!("* 1 FETCH (UID 1)", lines[0]);
        assert_eq!("* 2 FETCH (UID 2)", lines[1]);

        // Reselecting renumbers with fresh UIDs from the session counter
        let lines = run(&mut session, "C SELECT INBOX");
        assert!(lines.contains(&"* OK [UIDNEXT 5]".to_owned()));
        let lines = run(&mut session, "D FETCH 1:* (UID)");
        assert_eq!("* 1 FETCH (UID 3)", lines[0]);
        assert_eq!("* 2 FETCH (UID 4)", lines[1]);
    }

    #[test]
    fn starttls_and_logout() {
        let setup = set_up();
        let mut session = session(&setup);

        let reply = session.on_line("A STARTTLS");
        assert_eq!(
            vec!["A OK Begin TLS negotiation".to_owned()],
            text_lines(&reply)
        );
        assert_matches!(Event::StartTls, reply.event);

        session.on_tls_established();

        // STARTTLS no longer advertised nor accepted
        let lines = run(&mut session, "B CAPABILITY");
        assert!(!lines[0].contains("STARTTLS"));
        expect_tagged(&mut session, "C STARTTLS", "C BAD Already using TLS");

        // After login STARTTLS is out of state even without TLS
        let mut session2 = self::session(&setup);
        log_in(&mut session2);
        expect_tagged(&mut session2, "D STARTTLS", "D BAD");

        let reply = session2.on_line("E LOGOUT");
        assert_eq!(
            vec![
                "* BYE Logging out".to_owned(),
                "E OK LOGOUT completed".to_owned(),
            ],
            text_lines(&reply)
        );
        assert_matches!(Event::Logout, reply.event);
        assert!(session2.logged_out());
    }

    #[test]
    fn append_and_unknown_commands() {
        let setup = set_up();
        let mut session = session(&setup);
        log_in(&mut session);

        expect_tagged(&mut session, "A APPEND INBOX {310}", "A NO");
        expect_tagged(&mut session, "B XYZZY", "B BAD Unknown command");

        let reply = session.on_line("garbage");
        assert_eq!(vec!["* BAD Invalid command".to_owned()], text_lines(&reply));
    }
}
