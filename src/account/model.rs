//-
// Copyright (c) 2024, Jason Lingle
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

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};

/// A persistent message flag.
///
/// These are the five flags the maildir filename encoding can carry.
/// `\Recent` is deliberately absent: it is session state, inferred from a
/// message living in `new/`, and never written to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
}

impl Flag {
    /// The maildir info character for this flag.
    pub fn maildir_char(self) -> char {
        match self {
            Flag::Answered => 'R',
            Flag::Deleted => 'T',
            Flag::Draft => 'D',
            Flag::Flagged => 'F',
            Flag::Seen => 'S',
        }
    }

    pub fn from_maildir_char(ch: char) -> Option<Self> {
        match ch {
            'R' => Some(Flag::Answered),
            'T' => Some(Flag::Deleted),
            'D' => Some(Flag::Draft),
            'F' => Some(Flag::Flagged),
            'S' => Some(Flag::Seen),
            _ => None,
        }
    }

    /// The IMAP system flag name, including the backslash.
    pub fn name(self) -> &'static str {
        match self {
            Flag::Answered => "\\Answered",
            Flag::Deleted => "\\Deleted",
            Flag::Draft => "\\Draft",
            Flag::Flagged => "\\Flagged",
            Flag::Seen => "\\Seen",
        }
    }

    pub fn from_imap_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("\\Answered") {
            Some(Flag::Answered)
        } else if name.eq_ignore_ascii_case("\\Deleted") {
            Some(Flag::Deleted)
        } else if name.eq_ignore_ascii_case("\\Draft") {
            Some(Flag::Draft)
        } else if name.eq_ignore_ascii_case("\\Flagged") {
            Some(Flag::Flagged)
        } else if name.eq_ignore_ascii_case("\\Seen") {
            Some(Flag::Seen)
        } else {
            None
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub type FlagSet = BTreeSet<Flag>;

/// A message as scanned from a mailbox directory.
///
/// Immutable once parsed; a flag change is expressed by renaming the file
/// and rescanning.
#[derive(Clone, Debug)]
pub struct Message {
    /// The filename prefix before any `:2,` flag suffix.
    pub unique_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub internal_date: DateTime<Local>,
    pub flags: FlagSet,
    /// Whether the file lives in `new/` (and so implicitly carries
    /// `\Recent`).
    pub is_new: bool,
    pub mailbox: String,
}

impl Message {
    pub fn is_seen(&self) -> bool {
        self.flags.contains(&Flag::Seen)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(&Flag::Deleted)
    }
}

/// Aggregate counts for one mailbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub total: usize,
    pub recent: usize,
    pub unseen: usize,
    pub total_size: u64,
    pub uid_validity: u32,
    pub uid_next: u32,
}
