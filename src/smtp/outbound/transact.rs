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

//! One client-side SMTP transaction over an established connection.

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Why a transaction did not complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The transaction on this connection failed, but it's worth trying the
    /// next server. Carries the offending reply or I/O diagnostic.
    TryNextServer(String),
    /// The transaction failed and trying another server (or ever retrying)
    /// is futile.
    TotalFailure(String),
}

impl Error {
    pub fn message(&self) -> &str {
        match *self {
            Error::TryNextServer(ref m) | Error::TotalFailure(ref m) => m,
        }
    }
}

const MAX_LINE: usize = 1024;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes an SMTP transaction against an established connection.
///
/// `message` is delivered from `sender` to `recipient` via `cxn`. The body
/// is dot-stuffed on the way out. On success the remote server has accepted
/// responsibility for the message.
pub async fn execute(
    cxn: impl AsyncRead + AsyncWrite + Unpin,
    sender: &str,
    recipient: &str,
    message: &[u8],
    local_host_name: &str,
) -> Result<(), Error> {
    let tx = Transaction {
        cxn,
        sender,
        recipient,
        message,
        local_host_name,

        line_buffer: [0u8; MAX_LINE],
        line_buffer_len: 0,
        last_reply_comment: String::new(),
        command_deadline: Instant::now() + COMMAND_TIMEOUT,
    };
    tx.run().await
}

struct Transaction<'a, S> {
    cxn: S,
    sender: &'a str,
    recipient: &'a str,
    message: &'a [u8],
    local_host_name: &'a str,

    line_buffer: [u8; MAX_LINE],
    line_buffer_len: usize,
    last_reply_comment: String,
    command_deadline: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transaction<'_, S> {
    async fn run(mut self) -> Result<(), Error> {
        // Process greeting
        self.read_status_as_server().await?;
        self.execute_helo().await?;

        self.send_command(&format!("MAIL FROM:<{}>", self.sender))
            .await?;
        self.read_status_as_mail().await?;

        self.send_command(&format!("RCPT TO:<{}>", self.recipient))
            .await?;
        match self.read_status().await? {
            250 | 251 => {},
            status => return Err(self.classify_mail_status(status)),
        }

        self.send_message_via_data().await?;

        // The message has been sent. Do the mostly superfluous QUIT command,
        // but we don't care what actually happens.
        if self.send_command("QUIT").await.is_ok() {
            let _ = self.read_status().await;
        }

        Ok(())
    }

    async fn execute_helo(&mut self) -> Result<(), Error> {
        self.send_command(&format!("EHLO {}", self.local_host_name))
            .await?;
        match self.read_status().await? {
            200..=299 => return Ok(()),
            500..=504 | 550 => (), // Retry with legacy HELO
            status => return self.handle_status_as_server(status),
        }

        self.send_command(&format!("HELO {}", self.local_host_name))
            .await?;
        self.read_status_as_server().await
    }

    async fn send_message_via_data(&mut self) -> Result<(), Error> {
        self.send_command("DATA").await?;
        match self.read_status().await? {
            // 2XX status codes are undefined here, but some servers treat
            // them the same as 354.
            200..=299 | 354 => {},
            status => return Err(self.classify_mail_status(status)),
        }

        self.extend_command_deadline_for_transfer(self.message.len() as u64);
        let result = tokio::time::timeout_at(
            self.command_deadline.into(),
            write_dot_stuffed(&mut self.cxn, self.message),
        )
        .await;

        match result {
            Err(_timeout) => {
                return Err(Error::TryNextServer(
                    "Timed out sending message data".to_owned(),
                ));
            },
            Ok(Err(e)) => {
                return Err(Error::TryNextServer(format!(
                    "I/O error sending message data: {e}"
                )));
            },
            Ok(Ok(())) => {},
        }

        self.read_status_as_mail().await
    }

    /// Send the given command (which does not include the line ending) to
    /// the server.
    ///
    /// The command deadline is reset to the current time plus the standard
    /// command timeout.
    async fn send_command(&mut self, command: &str) -> Result<(), Error> {
        self.command_deadline = Instant::now() + COMMAND_TIMEOUT;
        let io = async {
            self.cxn.write_all(command.as_bytes()).await?;
            self.cxn.write_all(b"\r\n").await?;
            self.cxn.flush().await?;
            io::Result::Ok(())
        };

        match tokio::time::timeout_at(self.command_deadline.into(), io).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::TryNextServer(format!(
                "I/O error sending command to server: {e}"
            ))),
            Err(_) => Err(Error::TryNextServer(
                "Timeout sending command to server".to_owned(),
            )),
        }
    }

    /// Read a command status and interpret it as pertaining to this
    /// particular server.
    async fn read_status_as_server(&mut self) -> Result<(), Error> {
        let status = self.read_status().await?;
        self.handle_status_as_server(status)
    }

    fn handle_status_as_server(&mut self, status: u32) -> Result<(), Error> {
        match status {
            200..=299 => Ok(()),
            _ => Err(Error::TryNextServer(self.failing_reply(status))),
        }
    }

    /// Read a command status and interpret it as pertaining to this
    /// particular email message.
    async fn read_status_as_mail(&mut self) -> Result<(), Error> {
        let status = self.read_status().await?;
        match status {
            200..=299 => Ok(()),
            status => Err(self.classify_mail_status(status)),
        }
    }

    /// A 5XX reply to a mail command is a judgement on the message; no other
    /// server will accept it either. Anything else is worth retrying
    /// elsewhere.
    fn classify_mail_status(&mut self, status: u32) -> Error {
        let reply = self.failing_reply(status);
        match status {
            500..=599 => Error::TotalFailure(reply),
            _ => Error::TryNextServer(reply),
        }
    }

    fn failing_reply(&self, status: u32) -> String {
        format!("{} {}", status, self.last_reply_comment.trim())
    }

    /// Discard all responses until the next final response, and return the
    /// code on that response.
    ///
    /// The final line's comment is retained for diagnostics.
    async fn read_status(&mut self) -> Result<u32, Error> {
        for _ in 0..1000 {
            let line = self.read_line().await?;
            let parsed = parse_line(&line)
                .map(|l| (l.status, l.last, l.comment.to_owned()));
            self.consume_line(line.len());

            let Some((status, last, comment)) = parsed else {
                return Err(Error::TryNextServer(
                    "Bad SMTP response".to_owned(),
                ));
            };

            if last {
                self.last_reply_comment = comment;
                return Ok(status);
            }
        }

        Err(Error::TryNextServer(
            "Too many responses; giving up".to_owned(),
        ))
    }

    /// Read data from the server until `line_buffer` contains a line ending.
    /// On success, return the line that was read, excluding the line ending.
    async fn read_line(&mut self) -> Result<String, Error> {
        loop {
            if let Some(ix) = memchr::memchr(
                b'\n',
                &self.line_buffer[..self.line_buffer_len],
            ) {
                return Ok(String::from_utf8_lossy(&self.line_buffer[..ix])
                    .into_owned());
            }

            if self.line_buffer_len >= MAX_LINE {
                return Err(Error::TryNextServer(
                    "Server response line too long".to_owned(),
                ));
            }

            match tokio::time::timeout_at(
                self.command_deadline.into(),
                self.cxn
                    .read(&mut self.line_buffer[self.line_buffer_len..]),
            )
            .await
            {
                Err(_timeout) => {
                    return Err(Error::TryNextServer(
                        "Timed out reading line from server".to_owned(),
                    ));
                },

                Ok(Err(e)) => {
                    return Err(Error::TryNextServer(format!(
                        "I/O error reading line from server: {e}"
                    )));
                },

                Ok(Ok(0)) => {
                    return Err(Error::TryNextServer(
                        "EOF reading line from server".to_owned(),
                    ));
                },

                Ok(Ok(n)) => {
                    self.line_buffer_len += n;
                },
            }
        }
    }

    /// Drop a line previously returned by `read_line` (whose length was `n`
    /// excluding the line feed) from the front of the buffer.
    fn consume_line(&mut self, n: usize) {
        debug_assert!(n < self.line_buffer_len);
        debug_assert!(b'\n' == self.line_buffer[n]);

        self.line_buffer.copy_within(n + 1..self.line_buffer_len, 0);
        self.line_buffer_len -= n + 1;
    }

    fn extend_command_deadline_for_transfer(&mut self, size: u64) {
        // Extend the deadline to account for a 32kbps transfer rate.
        self.command_deadline += Duration::from_millis(size / 4);
    }
}

struct ParsedLine<'a> {
    status: u32,
    last: bool,
    comment: &'a str,
}

fn parse_line(s: &str) -> Option<ParsedLine<'_>> {
    let s = s.trim_end_matches(['\r', '\n']);
    let status = s.get(0..3)?;
    let status: u32 = status.parse().ok()?;

    // A bare "NNN" is a legal final reply with an empty comment.
    let (last, comment) = match s.get(3..4) {
        None => (true, ""),
        Some(" ") => (true, s.get(4..).unwrap_or("")),
        Some("-") => (false, s.get(4..).unwrap_or("")),
        Some(_) => return None,
    };

    Some(ParsedLine {
        status,
        last,
        comment,
    })
}

/// Copy `data` into `dst` with dot stuffing applied, terminated with
/// `CRLF.CRLF`.
async fn write_dot_stuffed(
    dst: &mut (impl AsyncWrite + Unpin),
    data: &[u8],
) -> io::Result<()> {
    let mut dst = tokio::io::BufWriter::new(dst);

    for line in data.split_inclusive(|&b| b'\n' == b) {
        if Some(&b'.') == line.first() {
            dst.write_all(b".").await?;
        }
        dst.write_all(line).await?;
    }

    if !data.is_empty() && !data.ends_with(b"\n") {
        dst.write_all(b"\r\n").await?;
    }
    dst.write_all(b".\r\n").await?;
    dst.flush().await?;

    Ok(())
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    use super::*;

    /// A scripted remote SMTP server over an in-memory stream.
    ///
    /// Returns the transcript of command and data lines it received.
    async fn fake_server(
        io: DuplexStream,
        ehlo_reply: &'static str,
        mail_reply: &'static str,
        rcpt_reply: &'static str,
        data_reply: &'static str,
        final_reply: &'static str,
    ) -> Vec<String> {
        let mut received = Vec::<String>::new();
        let (read, mut write) = tokio::io::split(io);
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"220 mx.test ESMTP ready\r\n").await.unwrap();

        let mut in_data = false;
        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line.clone());

            if in_data {
                if "." == line {
                    in_data = false;
                    write.write_all(final_reply.as_bytes()).await.unwrap();
                }
                continue;
            }

            let reply: &str = if line.starts_with("EHLO") {
                ehlo_reply
            } else if line.starts_with("HELO") {
                "250 mx.test\r\n"
            } else if line.starts_with("MAIL") {
                mail_reply
            } else if line.starts_with("RCPT") {
                rcpt_reply
            } else if "DATA" == line {
                in_data = data_reply.starts_with("354")
                    || data_reply.starts_with('2');
                data_reply
            } else if "QUIT" == line {
                write.write_all(b"221 bye\r\n").await.unwrap();
                break;
            } else {
                "500 what\r\n"
            };
            write.write_all(reply.as_bytes()).await.unwrap();
        }

        received
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_transaction(
        message: &[u8],
        ehlo_reply: &'static str,
        mail_reply: &'static str,
        rcpt_reply: &'static str,
        data_reply: &'static str,
        final_reply: &'static str,
    ) -> (Result<(), Error>, Vec<String>) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = tokio::spawn(fake_server(
            server_io,
            ehlo_reply,
            mail_reply,
            rcpt_reply,
            data_reply,
            final_reply,
        ));

        let result = execute(
            client_io,
            "zim@irk.example",
            "dib@earth.example",
            message,
            "irk.example",
        )
        .await;

        (result, server.await.unwrap())
    }

    #[test]
    fn happy_path_with_dot_stuffing() {
        let (result, received) = run_transaction(
            b"Subject: hi\r\n\r\n.leading dot\r\nplain\r\n",
            "250-mx.test\r\n250 PIPELINING\r\n",
            "250 OK\r\n",
            "250 OK\r\n",
            "354 go\r\n",
            "250 accepted\r\n",
        );

        result.unwrap();
        assert_eq!(
            vec![
                "EHLO irk.example".to_owned(),
                "MAIL FROM:<zim@irk.example>".to_owned(),
                "RCPT TO:<dib@earth.example>".to_owned(),
                "DATA".to_owned(),
                "Subject: hi".to_owned(),
                "".to_owned(),
                // The wire form gained a dot; the terminator did not
                "..leading dot".to_owned(),
                "plain".to_owned(),
                ".".to_owned(),
                "QUIT".to_owned(),
            ],
            received,
        );
    }

    #[test]
    fn falls_back_to_helo() {
        let (result, received) = run_transaction(
            b"x\r\n",
            "502 unrecognised\r\n",
            "250 OK\r\n",
            "250 OK\r\n",
            "354 go\r\n",
            "250 accepted\r\n",
        );

        result.unwrap();
        assert_eq!("EHLO irk.example", received[0]);
        assert_eq!("HELO irk.example", received[1]);
        assert_eq!("MAIL FROM:<zim@irk.example>", received[2]);
    }

    #[test]
    fn rcpt_251_is_success() {
        let (result, _) = run_transaction(
            b"x\r\n",
            "250 mx.test\r\n",
            "250 OK\r\n",
            "251 will forward\r\n",
            "354 go\r\n",
            "250 accepted\r\n",
        );
        result.unwrap();
    }

    #[test]
    fn permanent_rejection_is_total_failure() {
        let (result, _) = run_transaction(
            b"x\r\n",
            "250 mx.test\r\n",
            "250 OK\r\n",
            "550 no such user\r\n",
            "354 go\r\n",
            "250 accepted\r\n",
        );
        assert!(matches!(result, Err(Error::TotalFailure(_))));
        assert!(result.unwrap_err().message().contains("no such user"));
    }

    #[test]
    fn temporary_rejection_tries_next_server() {
        let (result, _) = run_transaction(
            b"x\r\n",
            "250 mx.test\r\n",
            "450 come back later\r\n",
            "250 OK\r\n",
            "354 go\r\n",
            "250 accepted\r\n",
        );
        assert!(matches!(result, Err(Error::TryNextServer(_))));
    }

    #[test]
    fn data_rejection_carries_reply_out() {
        let (result, _) = run_transaction(
            b"x\r\n",
            "250 mx.test\r\n",
            "250 OK\r\n",
            "250 OK\r\n",
            "554 no thanks\r\n",
            "250 accepted\r\n",
        );
        assert!(matches!(result, Err(Error::TotalFailure(_))));
        assert!(result.unwrap_err().message().contains("no thanks"));
    }

    #[test]
    fn message_without_final_newline_is_terminated() {
        let (result, received) = run_transaction(
            b"body without newline",
            "250 mx.test\r\n",
            "250 OK\r\n",
            "250 OK\r\n",
            "354 go\r\n",
            "250 accepted\r\n",
        );
        result.unwrap();
        let data_ix = received.iter().position(|l| "DATA" == l).unwrap();
        assert_eq!("body without newline", received[data_ix + 1]);
        assert_eq!(".", received[data_ix + 2]);
    }

    #[test]
    fn reply_line_parsing() {
        let line = parse_line("250-mx.example greets you\r\n").unwrap();
        assert_eq!(250, line.status);
        assert!(!line.last);
        assert_eq!("mx.example greets you", line.comment);

        let line = parse_line("250 done").unwrap();
        assert!(line.last);

        let line = parse_line("220").unwrap();
        assert!(line.last);
        assert_eq!(220, line.status);
        assert_eq!("", line.comment);

        assert!(parse_line("2x0 nope").is_none());
        assert!(parse_line("250_nope").is_none());
        assert!(parse_line("").is_none());
    }
}
