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

//! The `sysexits.h` exit codes the CLI raises.
//!
//! Mail tooling conventionally reports failures with these codes, so the
//! `die!`/`fatal!` macros take one. Only the codes Tridove actually exits
//! with are defined; more can be added from `sysexits.h` as commands grow.

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

/// Bad arguments, e.g. an address without a domain.
pub const EX_USAGE: Sysexit = Sysexit(64);
/// Input data invalid, e.g. password confirmation mismatch.
pub const EX_DATAERR: Sysexit = Sysexit(65);
/// Required input missing, e.g. an empty password prompt.
pub const EX_NOINPUT: Sysexit = Sysexit(66);
/// The addressed user does not exist.
pub const EX_NOUSER: Sysexit = Sysexit(67);
/// The addressed domain does not exist.
pub const EX_NOHOST: Sysexit = Sysexit(68);
/// A required service is unusable, e.g. the user directory won't open.
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
/// Internal error, e.g. the OpenSSL acceptor failed to initialise.
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
/// Operating system error, e.g. the runtime or host name lookup failed.
pub const EX_OSERR: Sysexit = Sysexit(71);
/// A user or domain could not be created.
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
/// The configuration file is missing or malformed.
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }
}
