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

//! The maildir store.
//!
//! One user's mail lives under `<root>/<domain>/<user>/`. That directory is
//! itself the INBOX (`tmp/`, `new/`, `cur/` siblings); every other mailbox
//! is a sibling directory named `.Name`, with `/` in hierarchical names
//! rewritten to `.`.
//!
//! A message is one file. Its name starts with a unique string that never
//! contains `:`; flags are carried in a `:2,<chars>` suffix. Delivery writes
//! into `tmp/` and renames into `new/`; the rename is the commit point.
//! Everything else in this module is directory scans and renames, which is
//! what makes the format safe for concurrent readers.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write as _};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use lazy_static::lazy_static;
use log::warn;
use rand::Rng;

use super::model::{Flag, FlagSet, MailboxInfo, Message};
use crate::support::{error::Error, safe_name::is_safe_mailbox_name};

lazy_static! {
    // `.uidvalidity` read-modify-write cycles serialize per mailbox path.
    // Concurrent sessions for the same user run in one process, so an
    // in-process lock is sufficient.
    static ref UID_LOCKS: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

pub struct Maildir {
    location: PathBuf,
    host_name: String,
}

impl Maildir {
    pub fn new(maildir_root: &Path, domain: &str, local: &str) -> Self {
        let host_name = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned());

        Self {
            location: maildir_root.join(domain).join(local),
            host_name,
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn exists(&self) -> bool {
        self.location.join("cur").is_dir()
            && self.location.join("new").is_dir()
            && self.location.join("tmp").is_dir()
    }

    /// Create the INBOX triad and the conventional folders if absent.
    ///
    /// Idempotent; called on first login and on first local delivery.
    pub fn initialize(&self) -> Result<(), Error> {
        ensure_mailbox_dirs(&self.location)?;
        for folder in ["Sent", "Drafts", "Trash", "Junk"] {
            self.create_mailbox(folder)?;
        }
        Ok(())
    }

    fn mailbox_path(&self, mailbox: &str) -> PathBuf {
        if mailbox.is_empty() || "INBOX" == mailbox {
            return self.location.clone();
        }

        let mut folder = String::with_capacity(mailbox.len() + 1);
        folder.push('.');
        for ch in mailbox.chars() {
            folder.push(if '/' == ch { '.' } else { ch });
        }
        self.location.join(folder)
    }

    pub fn mailbox_exists(&self, mailbox: &str) -> bool {
        self.mailbox_path(mailbox).join("cur").is_dir()
    }

    pub fn create_mailbox(&self, name: &str) -> Result<(), Error> {
        if name.is_empty() || "INBOX" == name {
            // INBOX always exists
            return ensure_mailbox_dirs(&self.location);
        }

        if !is_safe_mailbox_name(name) {
            return Err(Error::UnsafeName);
        }

        ensure_mailbox_dirs(&self.mailbox_path(name))
    }

    pub fn delete_mailbox(&self, name: &str) -> Result<(), Error> {
        if name.is_empty() || "INBOX" == name {
            return Err(Error::BadOperationOnInbox);
        }

        let path = self.mailbox_path(name);
        if !path.join("cur").is_dir() {
            return Err(Error::NxMailbox);
        }

        fs::remove_dir_all(path)?;
        Ok(())
    }

    pub fn rename_mailbox(&self, old: &str, new: &str) -> Result<(), Error> {
        if old.is_empty() || "INBOX" == old || new.is_empty() || "INBOX" == new
        {
            return Err(Error::BadOperationOnInbox);
        }

        if !is_safe_mailbox_name(new) {
            return Err(Error::UnsafeName);
        }

        let old_path = self.mailbox_path(old);
        if !old_path.join("cur").is_dir() {
            return Err(Error::NxMailbox);
        }

        fs::rename(old_path, self.mailbox_path(new))?;
        Ok(())
    }

    /// List mailbox names matching `pattern`.
    ///
    /// INBOX is always present. Pattern support is glob-prefix: `*` and `%`
    /// match everything, anything else matches names beginning with the
    /// literal text before the first `*`.
    pub fn list_mailboxes(&self, pattern: &str) -> Vec<String> {
        let mut mailboxes = vec!["INBOX".to_owned()];

        let entries = match fs::read_dir(&self.location) {
            Ok(entries) => entries,
            Err(_) => return mailboxes,
        };

        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(folder) = name.strip_prefix('.') else {
                continue;
            };
            if folder.is_empty() {
                continue;
            }

            let path = entry.path();
            if !path.join("cur").is_dir()
                || !path.join("new").is_dir()
                || !path.join("tmp").is_dir()
            {
                continue;
            }

            let name = folder.replace('.', "/");
            if matches_pattern(&name, pattern) {
                mailboxes.push(name);
            }
        }

        mailboxes.sort();
        mailboxes.dedup();
        mailboxes
    }

    pub fn get_mailbox_info(
        &self,
        mailbox: &str,
    ) -> Result<MailboxInfo, Error> {
        if !self.mailbox_exists(mailbox) {
            return Err(Error::NxMailbox);
        }

        let mut info = MailboxInfo {
            name: if mailbox.is_empty() {
                "INBOX".to_owned()
            } else {
                mailbox.to_owned()
            },
            uid_validity: self.get_uid_validity(mailbox)?,
            uid_next: self.peek_next_uid(mailbox)?,
            ..MailboxInfo::default()
        };

        for message in self.list_messages(mailbox) {
            info.total += 1;
            info.total_size += message.size;
            if message.is_new {
                info.recent += 1;
            }
            if !message.is_seen() {
                info.unseen += 1;
            }
        }

        Ok(info)
    }

    /// Deliver `content` into `mailbox`, returning the new unique id.
    ///
    /// The message is staged in `tmp/` and fsynced, then renamed into
    /// `new/`. Anything that fails before the rename leaves no visible
    /// message; the staging file is removed on a best-effort basis.
    pub fn deliver(
        &self,
        mailbox: &str,
        content: &[u8],
    ) -> Result<String, Error> {
        let path = self.mailbox_path(mailbox);
        if !path.join("tmp").is_dir() {
            ensure_mailbox_dirs(&path)?;
        }

        let unique = self.generate_unique_name();
        let tmp_path = path.join("tmp").join(&unique);
        let new_path = path.join("new").join(&unique);

        let write_result = (|| {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &new_path)
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        Ok(unique)
    }

    /// Scan `cur/` and `new/`, returning messages ordered by internal date.
    ///
    /// Entries that fail to parse or stat are skipped; a missing mailbox is
    /// an empty list.
    pub fn list_messages(&self, mailbox: &str) -> Vec<Message> {
        let path = self.mailbox_path(mailbox);
        let mut messages = Vec::new();

        for (subdir, is_new) in [("cur", false), ("new", true)] {
            let Ok(entries) = fs::read_dir(path.join(subdir)) else {
                continue;
            };

            for entry in entries.flatten() {
                match parse_message_file(&entry.path(), mailbox, is_new) {
                    Ok(Some(message)) => messages.push(message),
                    Ok(None) => {},
                    Err(e) => warn!(
                        "Skipping unreadable {}: {}",
                        entry.path().display(),
                        e
                    ),
                }
            }
        }

        // The unique id tiebreak keeps the order stable when several
        // messages share an mtime second.
        messages.sort_by(|a, b| {
            a.internal_date
                .cmp(&b.internal_date)
                .then_with(|| a.unique_id.cmp(&b.unique_id))
        });
        messages
    }

    pub fn get_message(
        &self,
        mailbox: &str,
        unique_id: &str,
    ) -> Result<Message, Error> {
        let path = self.mailbox_path(mailbox);

        for (subdir, is_new) in [("cur", false), ("new", true)] {
            let Ok(entries) = fs::read_dir(path.join(subdir)) else {
                continue;
            };

            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name == unique_id
                    || (name.starts_with(unique_id)
                        && name[unique_id.len()..].starts_with(':'))
                {
                    if let Some(message) =
                        parse_message_file(&entry.path(), mailbox, is_new)?
                    {
                        return Ok(message);
                    }
                }
            }
        }

        Err(Error::NxMessage)
    }

    pub fn get_message_content(
        &self,
        mailbox: &str,
        unique_id: &str,
    ) -> Result<Vec<u8>, Error> {
        let message = self.get_message(mailbox, unique_id)?;
        Ok(fs::read(message.path)?)
    }

    /// Return the header block: everything before the first empty line.
    pub fn get_message_headers(
        &self,
        mailbox: &str,
        unique_id: &str,
    ) -> Result<Vec<u8>, Error> {
        let mut content = self.get_message_content(mailbox, unique_id)?;

        if let Some(pos) = memchr::memmem::find(&content, b"\r\n\r\n") {
            content.truncate(pos);
        } else if let Some(pos) = memchr::memmem::find(&content, b"\n\n") {
            content.truncate(pos);
        }

        Ok(content)
    }

    /// Replace the message's flag set, renaming the file to match.
    ///
    /// A message still in `new/` is promoted into `cur/` as a side effect,
    /// which is what drops its implicit `\Recent` status.
    pub fn set_flags(
        &self,
        mailbox: &str,
        unique_id: &str,
        flags: &FlagSet,
    ) -> Result<(), Error> {
        let message = self.get_message(mailbox, unique_id)?;

        let mut chars = flags
            .iter()
            .map(|f| f.maildir_char())
            .collect::<Vec<char>>();
        chars.sort_unstable();

        let mut filename = String::with_capacity(unique_id.len() + 8);
        filename.push_str(unique_id);
        filename.push_str(":2,");
        filename.extend(chars);

        let new_path = self
            .mailbox_path(mailbox)
            .join("cur")
            .join(filename);
        fs::rename(message.path, new_path)?;
        Ok(())
    }

    pub fn add_flags(
        &self,
        mailbox: &str,
        unique_id: &str,
        flags: &FlagSet,
    ) -> Result<(), Error> {
        let message = self.get_message(mailbox, unique_id)?;
        let merged = message.flags.union(flags).copied().collect::<FlagSet>();
        self.set_flags(mailbox, unique_id, &merged)
    }

    pub fn remove_flags(
        &self,
        mailbox: &str,
        unique_id: &str,
        flags: &FlagSet,
    ) -> Result<(), Error> {
        let message = self.get_message(mailbox, unique_id)?;
        let remaining = message
            .flags
            .difference(flags)
            .copied()
            .collect::<FlagSet>();
        self.set_flags(mailbox, unique_id, &remaining)
    }

    pub fn delete_message(
        &self,
        mailbox: &str,
        unique_id: &str,
    ) -> Result<(), Error> {
        let message = self.get_message(mailbox, unique_id)?;
        fs::remove_file(message.path)?;
        Ok(())
    }

    /// Move a message between mailboxes, creating the destination on demand.
    pub fn move_message(
        &self,
        from: &str,
        to: &str,
        unique_id: &str,
    ) -> Result<(), Error> {
        let message = self.get_message(from, unique_id)?;

        let dest = self.mailbox_path(to);
        if !dest.join("cur").is_dir() {
            ensure_mailbox_dirs(&dest)?;
        }

        let filename = message
            .path
            .file_name()
            .ok_or(Error::NxMessage)?
            .to_owned();
        fs::rename(&message.path, dest.join("cur").join(filename))?;
        Ok(())
    }

    /// Copy a message by re-delivering its content, yielding a fresh unique
    /// id in the destination.
    pub fn copy_message(
        &self,
        from: &str,
        to: &str,
        unique_id: &str,
    ) -> Result<String, Error> {
        let content = self.get_message_content(from, unique_id)?;
        self.deliver(to, &content)
    }

    /// Unlink every message flagged `\Deleted`; returns how many went away.
    pub fn expunge(&self, mailbox: &str) -> Result<usize, Error> {
        let mut count = 0;
        for message in self.list_messages(mailbox) {
            if message.is_deleted() {
                self.delete_message(mailbox, &message.unique_id)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Total bytes across every mailbox of this user. Used for usage
    /// tracking only.
    pub fn total_size(&self) -> u64 {
        fn walk(dir: &Path, total: &mut u64) {
            let Ok(entries) = fs::read_dir(dir) else { return };
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else { continue };
                if file_type.is_dir() {
                    walk(&entry.path(), total);
                } else if file_type.is_file() {
                    if let Ok(meta) = entry.metadata() {
                        *total += meta.len();
                    }
                }
            }
        }

        let mut total = 0;
        walk(&self.location, &mut total);
        total
    }

    /// Read the mailbox's UIDVALIDITY, creating `.uidvalidity` with
    /// `(now, 1)` on first use.
    pub fn get_uid_validity(&self, mailbox: &str) -> Result<u32, Error> {
        let path = self.mailbox_path(mailbox);
        let lock = uid_lock(&path);
        let _guard = lock.lock().unwrap();
        let (validity, _) = self.read_or_create_uidvalidity(&path)?;
        Ok(validity)
    }

    /// The next UID `allocate_uid` would return, without allocating it.
    pub fn peek_next_uid(&self, mailbox: &str) -> Result<u32, Error> {
        let path = self.mailbox_path(mailbox);
        let lock = uid_lock(&path);
        let _guard = lock.lock().unwrap();
        let (_, next) = self.read_or_create_uidvalidity(&path)?;
        Ok(next)
    }

    /// Allocate and return the next UID for `mailbox`.
    ///
    /// UIDs are strictly increasing and never reused within a UIDVALIDITY
    /// epoch; the read-increment-write cycle runs under the per-mailbox
    /// lock.
    pub fn allocate_uid(&self, mailbox: &str) -> Result<u32, Error> {
        let path = self.mailbox_path(mailbox);
        let lock = uid_lock(&path);
        let _guard = lock.lock().unwrap();

        let (validity, next) = self.read_or_create_uidvalidity(&path)?;
        self.write_uidvalidity(&path, validity, next + 1)?;
        Ok(next)
    }

    fn read_or_create_uidvalidity(
        &self,
        mailbox_path: &Path,
    ) -> Result<(u32, u32), Error> {
        let file = mailbox_path.join(".uidvalidity");

        match fs::read_to_string(&file) {
            Ok(content) => {
                let mut numbers = content.split_whitespace();
                let (Some(validity), Some(next)) =
                    (numbers.next(), numbers.next())
                else {
                    return Err(Error::CorruptUidValidity);
                };
                let validity = validity
                    .parse::<u32>()
                    .map_err(|_| Error::CorruptUidValidity)?;
                let next = next
                    .parse::<u32>()
                    .map_err(|_| Error::CorruptUidValidity)?;
                Ok((validity, next))
            },

            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                let validity = Utc::now().timestamp() as u32;
                self.write_uidvalidity(mailbox_path, validity, 1)?;
                Ok((validity, 1))
            },

            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite `.uidvalidity` with new values, atomically.
    ///
    /// The file is staged in the mailbox's own `tmp/` (which is on the same
    /// file system by construction) and renamed into place, so a concurrent
    /// reader sees either the old counter pair or the new one, never a
    /// truncated file.
    fn write_uidvalidity(
        &self,
        mailbox_path: &Path,
        validity: u32,
        next: u32,
    ) -> Result<(), Error> {
        if !mailbox_path.join("tmp").is_dir() {
            ensure_mailbox_dirs(mailbox_path)?;
        }

        let mut staged =
            tempfile::NamedTempFile::new_in(mailbox_path.join("tmp"))?;
        staged.write_all(format!("{}\n{}\n", validity, next).as_bytes())?;
        fs::set_permissions(
            staged.path(),
            fs::Permissions::from_mode(0o600),
        )?;
        staged.as_file_mut().sync_all()?;
        staged
            .persist(mailbox_path.join(".uidvalidity"))
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn generate_unique_name(&self) -> String {
        let now = Utc::now();
        format!(
            "{}.M{}P{}R{}.{}",
            now.timestamp(),
            now.timestamp_subsec_micros(),
            nix::unistd::getpid(),
            rand::thread_rng().gen_range(0..1_000_000),
            self.host_name,
        )
    }
}

fn ensure_mailbox_dirs(mailbox_path: &Path) -> Result<(), Error> {
    for subdir in ["cur", "new", "tmp"] {
        fs::create_dir_all(mailbox_path.join(subdir))?;
    }
    Ok(())
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    if "*" == pattern || "%" == pattern {
        return true;
    }

    let prefix = &pattern[..pattern.find('*').unwrap_or(pattern.len())];
    name.starts_with(prefix)
}

fn parse_message_file(
    path: &Path,
    mailbox: &str,
    is_new: bool,
) -> Result<Option<Message>, Error> {
    let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };

    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Ok(None);
    }

    let unique_id = match filename.find(':') {
        Some(colon) => &filename[..colon],
        None => filename,
    };

    let mut flags = BTreeSet::new();
    if let Some(pos) = filename.find(":2,") {
        for ch in filename[pos + 3..].chars() {
            if let Some(flag) = Flag::from_maildir_char(ch) {
                flags.insert(flag);
            }
        }
    }

    let internal_date: DateTime<Local> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Local::now());

    Ok(Some(Message {
        unique_id: unique_id.to_owned(),
        path: path.to_owned(),
        size: metadata.len(),
        internal_date,
        flags,
        is_new,
        mailbox: if mailbox.is_empty() {
            "INBOX".to_owned()
        } else {
            mailbox.to_owned()
        },
    }))
}

fn uid_lock(mailbox_path: &Path) -> Arc<Mutex<()>> {
    let mut locks = UID_LOCKS.lock().unwrap();
    Arc::clone(
        locks
            .entry(mailbox_path.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(()))),
    )
}
