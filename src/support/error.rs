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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox name")]
    UnsafeName,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Non-existent message")]
    NxMessage,
    #[error("No such user")]
    NxUser,
    #[error("No such domain")]
    NxDomain,
    #[error("User already exists")]
    UserExists,
    #[error("Domain already exists")]
    DomainExists,
    #[error("Operation not allowed for INBOX")]
    BadOperationOnInbox,
    #[error("Malformed password hash")]
    BadPasswordHash,
    #[error("Corrupted .uidvalidity file")]
    CorruptUidValidity,
    #[error("Connection idle timer expired")]
    IdleTimeout,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
