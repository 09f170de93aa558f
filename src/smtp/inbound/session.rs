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

//! The inbound SMTP state machine.
//!
//! `Session` is deliberately free of I/O: every input line maps to a `Reply`
//! of response lines plus an optional event the connection loop must act on
//! (TLS upgrade, delivery, disconnect). This is what keeps the protocol
//! logic testable line-by-line.

use std::str;
use std::sync::Arc;

use chrono::Local;
use log::{info, warn};

use super::super::codes::*;
use super::super::syntax::{
    looks_like_known_command, Command, EmailAddress,
};
use crate::auth::DirectoryStore;
use crate::support::log_prefix::LogPrefix;

const MAX_INEFFECTIVE_COMMANDS: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connected,
    Greeted,
    Mail,
    Rcpt,
    Data,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum AuthState {
    None,
    PlainWaiting,
    LoginWaitingUsername,
    LoginWaitingPassword(String),
}

/// A recipient accepted at RCPT time, with the routing decision that
/// accepted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub address: EmailAddress,
    pub local: bool,
}

/// A complete message handed over by the DATA terminator, ready for
/// delivery fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMail {
    pub sender: EmailAddress,
    pub recipients: Vec<Recipient>,
    pub data: Vec<u8>,
}

/// What the connection loop must do after sending the reply lines.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    None,
    /// Flush, then perform the server-side TLS handshake.
    StartTls,
    /// Flush and close the connection.
    Quit,
    /// Attempt delivery, then reply 250 or 451.
    Deliver(OutgoingMail),
}

#[derive(Debug)]
pub struct Reply {
    pub lines: Vec<String>,
    pub event: Event,
}

impl Reply {
    fn one(line: String) -> Self {
        Reply {
            lines: vec![line],
            event: Event::None,
        }
    }

    fn none() -> Self {
        Reply {
            lines: vec![],
            event: Event::None,
        }
    }
}

fn reply(code: PrimaryCode, text: &str) -> String {
    format!("{} {}", code.code(), text)
}

/// Everything the session needs to know about its environment.
pub struct SessionParams {
    pub log_prefix: LogPrefix,
    pub store: Arc<DirectoryStore>,
    pub host_name: String,
    /// The peer address, for the Received header.
    pub peer: String,
    pub local_domains: Vec<String>,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub require_auth: bool,
    pub allow_relay: bool,
    pub starttls_available: bool,
    pub tls_active: bool,
}

pub struct Session {
    params: SessionParams,

    state: State,
    auth_state: AuthState,
    authenticated: Option<String>,
    client_helo: String,
    ineffective_commands: u32,

    mail_from: Option<EmailAddress>,
    recipients: Vec<Recipient>,
    data_buffer: Vec<u8>,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        Session {
            params,
            state: State::Connected,
            auth_state: AuthState::None,
            authenticated: None,
            client_helo: String::new(),
            ineffective_commands: 0,
            mail_from: None,
            recipients: Vec::new(),
            data_buffer: Vec::new(),
        }
    }

    pub fn greeting(&self) -> String {
        reply(
            pc::ServiceReady,
            &format!(
                "{} {} ready",
                self.params.host_name,
                if self.params.tls_active {
                    "ESMTPS"
                } else {
                    "ESMTP"
                },
            ),
        )
    }

    /// Called by the connection loop once a STARTTLS handshake succeeds.
    pub fn on_tls_established(&mut self) {
        self.params.tls_active = true;
        self.params.starttls_available = false;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.is_some()
    }

    /// Whether the session is between the 354 prompt and the lone dot.
    ///
    /// Message content gets a larger line allowance than commands do.
    pub fn receiving_data(&self) -> bool {
        State::Data == self.state
    }

    /// Process one input line.
    pub fn on_line(&mut self, line: &[u8]) -> Reply {
        if State::Data == self.state {
            return self.data_line(line);
        }

        let Ok(line) = str::from_utf8(line) else {
            warn!("{} Non-UTF-8 command received", self.params.log_prefix);
            return Reply::one(reply(
                pc::CommandSyntaxError,
                "Malformed UTF-8",
            ));
        };

        if AuthState::None != self.auth_state {
            return self.auth_response(line);
        }

        self.ineffective_commands += 1;
        if self.ineffective_commands > MAX_INEFFECTIVE_COMMANDS {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.params.log_prefix,
            );
            return Reply {
                lines: vec![reply(
                    pc::ServiceClosing,
                    "Too many commands issued without sending mail",
                )],
                event: Event::Quit,
            };
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(()) => {
                let mut debug_line = line;
                if let Some((truncate_len, _)) =
                    debug_line.char_indices().nth(64)
                {
                    debug_line = &debug_line[..truncate_len];
                }
                warn!(
                    "{} Received bad command {debug_line:?}",
                    self.params.log_prefix,
                );
                return Reply::one(if looks_like_known_command(line) {
                    reply(pc::ParameterSyntaxError, "Unknown command syntax")
                } else {
                    reply(pc::CommandSyntaxError, "Unrecognised command")
                });
            },
        };

        match command {
            Command::Helo(command, origin) => self.cmd_helo(command, origin),
            Command::Auth(mechanism, data) => self.cmd_auth(mechanism, data),
            Command::MailFrom(path, size, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.params.log_prefix, warning);
                }
                self.cmd_mail_from(path, size)
            },
            Command::Recipient(path, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.params.log_prefix, warning);
                }
                self.cmd_recipient(path)
            },
            Command::Data => self.cmd_data(),
            Command::Reset => self.cmd_reset(),
            Command::Verify(address) => self.cmd_verify(address),
            Command::Help => self.cmd_help(),
            Command::Noop => {
                Reply::one(reply(pc::Ok, "OK"))
            },
            Command::Quit => Reply {
                lines: vec![reply(
                    pc::ServiceClosing,
                    &format!(
                        "{} closing connection",
                        self.params.host_name
                    ),
                )],
                event: Event::Quit,
            },
            Command::StartTls => self.cmd_start_tls(),
            Command::Http => {
                warn!(
                    "{} Remote is speaking HTTP, closing connection",
                    self.params.log_prefix,
                );
                Reply {
                    lines: vec![],
                    event: Event::Quit,
                }
            },
        }
    }

    fn cmd_helo(&mut self, command: String, origin: String) -> Reply {
        let extended = "EHLO" == command;
        info!("{} SMTP {command} from {origin}", self.params.log_prefix);

        self.client_helo = origin.clone();
        self.state = State::Greeted;
        self.clear_envelope();

        if !extended {
            return Reply::one(reply(
                pc::Ok,
                &format!("{} Hello {}", self.params.host_name, origin),
            ));
        }

        let mut capabilities = vec![
            format!("{} Hello {}", self.params.host_name, origin),
            format!("SIZE {}", self.params.max_message_size),
            "8BITMIME".to_owned(),
            "PIPELINING".to_owned(),
        ];
        if self.params.starttls_available && !self.params.tls_active {
            capabilities.push("STARTTLS".to_owned());
        }
        if !self.is_authenticated() {
            capabilities.push("AUTH PLAIN LOGIN".to_owned());
        }

        let code = pc::Ok.code();
        let last = capabilities.len() - 1;
        Reply {
            lines: capabilities
                .iter()
                .enumerate()
                .map(|(ix, cap)| {
                    format!(
                        "{}{}{}",
                        code,
                        if ix == last { ' ' } else { '-' },
                        cap
                    )
                })
                .collect(),
            event: Event::None,
        }
    }

    fn cmd_auth(&mut self, mechanism: String, data: Option<String>) -> Reply {
        if State::Connected == self.state {
            return Reply::one(reply(
                pc::BadSequenceOfCommands,
                "Send HELO/EHLO first",
            ));
        }

        if self.is_authenticated() {
            return Reply::one(reply(
                pc::BadSequenceOfCommands,
                "Already authenticated",
            ));
        }

        if mechanism.eq_ignore_ascii_case("PLAIN") {
            match data {
                Some(data) if "=" != data => self.auth_plain_blob(&data),
                _ => {
                    self.auth_state = AuthState::PlainWaiting;
                    Reply::one(reply(pc::ServerChallenge, ""))
                },
            }
        } else if mechanism.eq_ignore_ascii_case("LOGIN") {
            match data {
                Some(data) => match base64::decode(&data) {
                    Ok(username) => {
                        self.auth_state = AuthState::LoginWaitingPassword(
                            String::from_utf8_lossy(&username).into_owned(),
                        );
                        Reply::one(reply(
                            pc::ServerChallenge,
                            &base64::encode("Password:"),
                        ))
                    },
                    Err(_) => Reply::one(reply(
                        pc::ParameterSyntaxError,
                        "Invalid base64",
                    )),
                },
                None => {
                    self.auth_state = AuthState::LoginWaitingUsername;
                    Reply::one(reply(
                        pc::ServerChallenge,
                        &base64::encode("Username:"),
                    ))
                },
            }
        } else if mechanism.eq_ignore_ascii_case("CRAM-MD5") {
            // Challenge-response requires recoverable passwords, which the
            // directory does not store.
            warn!(
                "{} Rejected CRAM-MD5 authentication attempt",
                self.params.log_prefix,
            );
            Reply::one(reply(
                pc::AuthenticationCredentialsInvalid,
                "Authentication failed",
            ))
        } else {
            warn!(
                "{} Rejected attempt to auth with mechanism {mechanism:?}",
                self.params.log_prefix,
            );
            Reply::one(reply(
                pc::CommandParameterNotImplemented,
                "Unknown authentication mechanism",
            ))
        }
    }

    /// One line of an in-progress SASL sub-dialogue.
    fn auth_response(&mut self, line: &str) -> Reply {
        if "*" == line {
            self.auth_state = AuthState::None;
            return Reply::one(reply(pc::ParameterSyntaxError, "SASL aborted"));
        }

        match std::mem::replace(&mut self.auth_state, AuthState::None) {
            AuthState::PlainWaiting => self.auth_plain_blob(line),

            AuthState::LoginWaitingUsername => match base64::decode(line) {
                Ok(username) => {
                    self.auth_state = AuthState::LoginWaitingPassword(
                        String::from_utf8_lossy(&username).into_owned(),
                    );
                    Reply::one(reply(
                        pc::ServerChallenge,
                        &base64::encode("Password:"),
                    ))
                },
                Err(_) => Reply::one(reply(
                    pc::ParameterSyntaxError,
                    "Invalid base64",
                )),
            },

            AuthState::LoginWaitingPassword(username) => {
                match base64::decode(line) {
                    Ok(password) => self.finish_auth(
                        &username,
                        &String::from_utf8_lossy(&password),
                    ),
                    Err(_) => Reply::one(reply(
                        pc::ParameterSyntaxError,
                        "Invalid base64",
                    )),
                }
            },

            AuthState::None => unreachable!(),
        }
    }

    /// Decode and check an RFC 4616 PLAIN blob:
    /// `<authorise-id> NUL <authenticate-id> NUL <password>`.
    fn auth_plain_blob(&mut self, data: &str) -> Reply {
        self.auth_state = AuthState::None;

        let Ok(decoded) = base64::decode(data) else {
            return Reply::one(reply(
                pc::ParameterSyntaxError,
                "Invalid base64",
            ));
        };
        let decoded = String::from_utf8_lossy(&decoded).into_owned();

        let mut parts = decoded.split('\x00');
        let (Some(authorise), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Reply::one(reply(
                pc::ParameterSyntaxError,
                "Invalid credentials format",
            ));
        };

        if !authorise.is_empty() && authorise != authenticate {
            return Reply::one(reply(
                pc::AuthenticationCredentialsInvalid,
                "authorise-id must match authenticate-id",
            ));
        }

        self.finish_auth(authenticate, password)
    }

    fn finish_auth(&mut self, userid: &str, password: &str) -> Reply {
        self.auth_state = AuthState::None;

        if self.params.store.authenticate(userid, password) {
            info!("{} Authenticated as {userid}", self.params.log_prefix);
            self.params.log_prefix.set_user(userid.to_owned());
            self.authenticated = Some(userid.to_owned());
            Reply::one(reply(
                pc::AuthenticationSucceeded,
                "Authentication successful",
            ))
        } else {
            warn!(
                "{} Authentication failed for {userid}",
                self.params.log_prefix,
            );
            Reply::one(reply(
                pc::AuthenticationCredentialsInvalid,
                "Authentication failed",
            ))
        }
    }

    fn cmd_mail_from(&mut self, path: String, size: Option<u64>) -> Reply {
        if State::Connected == self.state {
            return Reply::one(reply(
                pc::BadSequenceOfCommands,
                "Send HELO/EHLO first",
            ));
        }

        if self.params.require_auth && !self.is_authenticated() {
            return Reply::one(reply(
                pc::AuthenticationRequired,
                "Authentication required",
            ));
        }

        if size.unwrap_or(0) > self.params.max_message_size as u64 {
            return Reply::one(reply(
                pc::ExceededStorageAllocation,
                &format!(
                    "Maximum message size is {} bytes",
                    self.params.max_message_size
                ),
            ));
        }

        let Some(sender) = EmailAddress::parse(&path) else {
            return Reply::one(reply(
                pc::ParameterSyntaxError,
                "Invalid sender address",
            ));
        };

        info!("{} Start mail transaction", self.params.log_prefix);
        self.ineffective_commands = 0;
        self.clear_envelope();
        self.mail_from = Some(sender);
        self.state = State::Mail;
        Reply::one(reply(pc::Ok, "OK"))
    }

    fn cmd_recipient(&mut self, path: String) -> Reply {
        if State::Mail != self.state && State::Rcpt != self.state {
            return Reply::one(reply(
                pc::BadSequenceOfCommands,
                "Send MAIL FROM first",
            ));
        }

        if self.recipients.len() >= self.params.max_recipients {
            return Reply::one(reply(
                pc::InsufficientStorage,
                "Too many recipients",
            ));
        }

        let recipient = match EmailAddress::parse(&path) {
            Some(address) if !address.is_null() => address,
            _ => {
                return Reply::one(reply(
                    pc::ParameterSyntaxError,
                    "Invalid recipient address",
                ));
            },
        };

        let local = self.is_local_domain(&recipient.domain);

        if local {
            if !self
                .params
                .store
                .user_exists(&recipient.local, &recipient.domain)
            {
                return Reply::one(reply(
                    pc::ActionNotTakenPermanent,
                    "User not found",
                ));
            }
        } else if !self.is_authenticated() && !self.params.allow_relay {
            warn!(
                "{} Relay denied for {recipient}",
                self.params.log_prefix,
            );
            return Reply::one(reply(
                pc::AuthenticationRequired,
                "Relay access denied",
            ));
        }

        self.ineffective_commands = 0;
        self.recipients.push(Recipient {
            address: recipient,
            local,
        });
        self.state = State::Rcpt;
        Reply::one(reply(pc::Ok, "OK"))
    }

    fn cmd_data(&mut self) -> Reply {
        if State::Rcpt != self.state || self.recipients.is_empty() {
            return Reply::one(reply(
                pc::BadSequenceOfCommands,
                "Send RCPT TO first",
            ));
        }

        self.ineffective_commands = 0;
        self.state = State::Data;
        Reply::one(reply(
            pc::StartMailInput,
            "Start mail input; end with <CRLF>.<CRLF>",
        ))
    }

    /// One line of message content between the 354 prompt and the lone dot.
    fn data_line(&mut self, line: &[u8]) -> Reply {
        if b"." == line {
            let mail = OutgoingMail {
                sender: self.mail_from.take().unwrap_or(EmailAddress {
                    local: String::new(),
                    domain: String::new(),
                }),
                recipients: std::mem::take(&mut self.recipients),
                data: self.finish_message(),
            };
            self.state = State::Greeted;
            return Reply {
                lines: vec![],
                event: Event::Deliver(mail),
            };
        }

        // One leading dot is transfer encoding, not content
        let line = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            line
        };

        if self.data_buffer.len() + line.len() + 2
            > self.params.max_message_size
        {
            warn!(
                "{} Message exceeded size limit, dropping transaction",
                self.params.log_prefix,
            );
            self.clear_envelope();
            self.state = State::Greeted;
            return Reply::one(reply(
                pc::ExceededStorageAllocation,
                "Message too large",
            ));
        }

        self.data_buffer.extend_from_slice(line);
        self.data_buffer.extend_from_slice(b"\r\n");
        Reply::none()
    }

    /// Prepend the Received header and take the accumulated content.
    fn finish_message(&mut self) -> Vec<u8> {
        let received = format!(
            "Received: from {} ({})\r\n\tby {} with {};\r\n\t{}\r\n",
            self.client_helo,
            self.params.peer,
            self.params.host_name,
            if self.params.tls_active {
                "ESMTPS"
            } else {
                "ESMTP"
            },
            Local::now().to_rfc2822(),
        );

        let mut message =
            Vec::with_capacity(received.len() + self.data_buffer.len());
        message.extend_from_slice(received.as_bytes());
        message.append(&mut self.data_buffer);
        message
    }

    fn cmd_reset(&mut self) -> Reply {
        self.clear_envelope();
        if State::Connected != self.state {
            self.state = State::Greeted;
        }
        Reply::one(reply(pc::Ok, "OK"))
    }

    fn cmd_verify(&mut self, raw: String) -> Reply {
        let raw = raw
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');

        if let Some(address) = EmailAddress::parse(raw) {
            if !address.is_null()
                && self.is_local_domain(&address.domain)
                && self
                    .params
                    .store
                    .user_exists(&address.local, &address.domain)
            {
                return Reply::one(reply(pc::Ok, &address.to_string()));
            }
        }

        Reply::one(reply(pc::CannotVerify, "Cannot verify user"))
    }

    fn cmd_help(&mut self) -> Reply {
        let code = pc::HelpMessage.code();
        Reply {
            lines: vec![
                format!("{}-{} supports:", code, self.params.host_name),
                format!(
                    "{} HELO EHLO MAIL RCPT DATA RSET NOOP QUIT VRFY \
                     AUTH STARTTLS HELP",
                    code
                ),
            ],
            event: Event::None,
        }
    }

    fn cmd_start_tls(&mut self) -> Reply {
        if self.params.tls_active {
            return Reply::one(reply(
                pc::BadSequenceOfCommands,
                "Already using TLS",
            ));
        }

        if !self.params.starttls_available {
            return Reply::one(reply(
                pc::CommandNotImplemented,
                "STARTTLS not available",
            ));
        }

        // The whole session restarts underneath the handshake
        self.state = State::Connected;
        self.client_helo.clear();
        self.clear_envelope();

        Reply {
            lines: vec![reply(pc::ServiceReady, "Ready to start TLS")],
            event: Event::StartTls,
        }
    }

    fn is_local_domain(&self, domain: &str) -> bool {
        self.params
            .local_domains
            .iter()
            .any(|local| local == domain)
            || self.params.store.is_local_domain(domain)
    }

    fn clear_envelope(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
        self.data_buffer.clear();
    }
}
