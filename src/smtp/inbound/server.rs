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

//! The connection loop for inbound SMTP.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::session::{Event, OutgoingMail, Session};
use crate::account::maildir::Maildir;
use crate::auth::DirectoryStore;
use crate::smtp::outbound;
use crate::support::{
    async_io::ServerIo, dns, error::Error, idle::idle_timer,
    log_prefix::LogPrefix,
};

const MAX_COMMAND_LINE: usize = 1024;
const MAX_DATA_LINE: usize = 64 * 1024;
const DATA_DEADLINE: Duration = Duration::from_secs(1800);

/// Connection-independent state shared by every inbound SMTP connection.
pub struct Context {
    pub store: Arc<DirectoryStore>,
    pub maildir_root: PathBuf,
    pub resolver: Arc<dns::Resolver>,
    pub ssl_acceptor: Option<Arc<SslAcceptor>>,
    pub host_name: String,
    pub idle_timeout: Duration,
}

/// Drive one inbound SMTP connection to completion.
pub async fn run(
    io: ServerIo,
    ctx: Arc<Context>,
    log_prefix: LogPrefix,
    mut session: Session,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);
    let idle_timeout = ctx.idle_timeout;

    let mut server = Server {
        io: BufStream::new(io.clone()),
        raw_io: io,
        ctx,
        log_prefix,
        deadline_tx,
        quit: false,
    };

    tokio::select! {
        r = server.run(&mut session) => r,
        _ = idle_timer(deadline_rx, idle_timeout) => Err(Error::IdleTimeout),
    }
}

struct Server {
    io: BufStream<ServerIo>,
    raw_io: ServerIo,
    ctx: Arc<Context>,
    log_prefix: LogPrefix,
    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,
}

impl Server {
    async fn run(&mut self, session: &mut Session) -> Result<(), Error> {
        self.send_line(&session.greeting()).await?;
        self.io.flush().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(session, &mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(
        &mut self,
        session: &mut Session,
        buffer: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + self.ctx.idle_timeout)
            .await;
        buffer.clear();

        let max_line = if session.receiving_data() {
            MAX_DATA_LINE
        } else {
            MAX_COMMAND_LINE
        };

        (&mut self.io)
            .take(max_line as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= max_line {
                if session.receiving_data() {
                    // There is no way to resynchronise with the message
                    // body; drop the connection.
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Data line too long",
                    )));
                }

                self.send_line("500 Command line too long").await?;
                self.io.flush().await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(max_line as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        // Drop the line ending; a lone LF is tolerated
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }

        let reply = session.on_line(buffer);
        for line in &reply.lines {
            self.send_line(line).await?;
        }
        self.io.flush().await?;

        match reply.event {
            Event::None => {},

            Event::Quit => {
                self.quit = true;
            },

            Event::StartTls => self.start_tls(session).await?,

            Event::Deliver(mail) => {
                // A large fan-out can legitimately take a while
                let _ = self
                    .deadline_tx
                    .send(Instant::now() + DATA_DEADLINE)
                    .await;

                let delivered = deliver(&self.ctx, &self.log_prefix, mail)
                    .await;
                self.send_line(if delivered {
                    "250 Message accepted for delivery"
                } else {
                    "451 Delivery failed"
                })
                .await?;
                self.io.flush().await?;
            },
        }

        Ok(())
    }

    async fn start_tls(&mut self, session: &mut Session) -> Result<(), Error> {
        let Some(acceptor) = self.ctx.ssl_acceptor.clone() else {
            // The session never offers STARTTLS without an acceptor
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "STARTTLS accepted without an acceptor",
            )));
        };

        info!("{} Start TLS handshake", self.log_prefix);
        self.raw_io.ssl_accept(&acceptor).await?;
        info!("{} TLS handshake completed", self.log_prefix);

        // Anything the client pipelined behind STARTTLS is still sitting in
        // the old read buffer; rebuilding the stream discards it so
        // cleartext bytes cannot be replayed as post-handshake commands.
        self.io = BufStream::new(self.raw_io.clone());
        session.on_tls_established();
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<(), Error> {
        self.io.write_all(line.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        Ok(())
    }
}

/// Fan a completed message out to its recipients.
///
/// Returns true only if every recipient was delivered; the session's single
/// final reply is all-or-nothing.
async fn deliver(
    ctx: &Context,
    log_prefix: &LogPrefix,
    mail: OutgoingMail,
) -> bool {
    let mut all_delivered = true;

    for recipient in &mail.recipients {
        let delivered = if recipient.local {
            deliver_local(
                ctx,
                &recipient.address.local,
                &recipient.address.domain,
                &mail.data,
            )
        } else {
            let result = outbound::deliver_remote(
                &ctx.resolver,
                &ctx.host_name,
                &mail.sender.to_string(),
                &recipient.address.to_string(),
                &mail.data,
            )
            .await;
            if !result.success {
                error!(
                    "{} Failed to relay to {}: {}",
                    log_prefix, recipient.address, result.error
                );
            }
            result.success
        };

        all_delivered &= delivered;
    }

    info!(
        "{} Completed data transfer {}",
        log_prefix,
        if all_delivered {
            "successfully"
        } else {
            "unsuccessfully"
        },
    );
    all_delivered
}

/// Write one message into a local user's INBOX.
pub(crate) fn deliver_local(
    ctx: &Context,
    local: &str,
    domain: &str,
    data: &[u8],
) -> bool {
    let maildir = Maildir::new(&ctx.maildir_root, domain, local);
    if !maildir.exists() {
        if let Err(e) = maildir.initialize() {
            error!(
                "Failed to initialise maildir for {local}@{domain}: {e}"
            );
            return false;
        }
    }

    match maildir.deliver("INBOX", data) {
        Ok(unique_id) => {
            info!("Delivered message {unique_id} to {local}@{domain}");
            // Advance the mailbox's UID sequence for the new arrival
            if let Err(e) = maildir.allocate_uid("INBOX") {
                warn!("Failed to advance UIDs for {local}@{domain}: {e}");
            }
            if let Err(e) =
                ctx.store.add_used_bytes(local, domain, data.len() as i64)
            {
                warn!("Failed to update usage for {local}@{domain}: {e}");
            }
            true
        },
        Err(e) => {
            error!("Failed to deliver message to {local}@{domain}: {e}");
            false
        },
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;

    fn context(dir: &TempDir) -> Context {
        let store = Arc::new(
            DirectoryStore::open(&dir.path().join("users.sqlite")).unwrap(),
        );
        store.create_user("dib", "earth.example", "hunter2", 1024).unwrap();

        Context {
            store,
            maildir_root: dir.path().join("mail"),
            resolver: Arc::new(resolver()),
            ssl_acceptor: None,
            host_name: "mail.earth.example".to_owned(),
            idle_timeout: Duration::from_secs(300),
        }
    }

    #[tokio::main(flavor = "current_thread")]
    async fn resolver() -> dns::Resolver {
        dns::system_resolver()
    }

    #[test]
    fn local_delivery_creates_maildir_and_tracks_usage() {
        crate::init_test_log();
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let data = b"Received: from c (127.0.0.1)\r\n\r\nhello\r\n";
        assert!(deliver_local(&ctx, "dib", "earth.example", data));

        let maildir =
            Maildir::new(&ctx.maildir_root, "earth.example", "dib");
        let messages = maildir.list_messages("INBOX");
        assert_eq!(1, messages.len());
        assert_eq!(
            data.as_slice(),
            maildir
                .get_message_content("INBOX", &messages[0].unique_id)
                .unwrap()
                .as_slice()
        );

        let user = ctx.store.get_user("dib", "earth.example").unwrap().unwrap();
        assert_eq!(data.len() as i64, user.used_bytes);

        // A second delivery reuses the existing maildir
        assert!(deliver_local(&ctx, "dib", "earth.example", b"more\r\n"));
        assert_eq!(2, maildir.list_messages("INBOX").len());
    }
}
