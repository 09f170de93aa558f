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

//! The connection loop for IMAP.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use super::session::{Event, Session};
use crate::support::{
    async_io::ServerIo, error::Error, idle::idle_timer,
    log_prefix::LogPrefix,
};

// Sequence sets can make command lines long; be generous
const MAX_LINE: usize = 8192;

pub struct Context {
    pub ssl_acceptor: Option<Arc<SslAcceptor>>,
    pub idle_timeout: Duration,
}

/// Drive one IMAP connection to completion.
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
}

impl Server {
    async fn run(&mut self, session: &mut Session) -> Result<(), Error> {
        self.send_line(session.greeting().as_bytes()).await?;
        self.io.flush().await?;

        let mut buffer = Vec::new();
        while !session.logged_out() {
            if !self.run_command(session, &mut buffer).await? {
                break;
            }
        }

        Ok(())
    }

    /// Process one command line; false means the connection is done.
    async fn run_command(
        &mut self,
        session: &mut Session,
        buffer: &mut Vec<u8>,
    ) -> Result<bool, Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + self.ctx.idle_timeout)
            .await;
        buffer.clear();

        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.send_line(b"* BAD Command line too long").await?;
                self.io.flush().await?;

                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(true);
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }

        let line = String::from_utf8_lossy(buffer).into_owned();
        let reply = session.on_line(&line);
        for line in &reply.lines {
            self.send_line(line).await?;
        }
        self.io.flush().await?;

        match reply.event {
            Event::None => Ok(true),

            Event::Logout => Ok(false),

            Event::StartTls => {
                let Some(acceptor) = self.ctx.ssl_acceptor.clone() else {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "STARTTLS accepted without an acceptor",
                    )));
                };

                info!("{} Start TLS handshake", self.log_prefix);
                self.raw_io.ssl_accept(&acceptor).await?;
                info!("{} TLS handshake completed", self.log_prefix);

                // Any bytes the client pipelined behind STARTTLS were read
                // into the old buffer in cleartext; dropping it here is
                // what prevents them from being executed as commands on
                // the TLS session.
                self.io = BufStream::new(self.raw_io.clone());
                session.on_tls_established();
                Ok(true)
            },
        }
    }

    async fn send_line(&mut self, line: &[u8]) -> Result<(), Error> {
        self.io.write_all(line).await?;
        self.io.write_all(b"\r\n").await?;
        Ok(())
    }
}
