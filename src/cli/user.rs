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

//! User and domain administration against the directory store.

use rand::{rngs::OsRng, Rng};

use super::main::{DomainSubcommand, UserAddSubcommand, UserSubcommand};
use crate::account::maildir::Maildir;
use crate::auth::{parse_userid, DirectoryStore};
use crate::support::system_config::SystemConfig;

pub(super) fn user(system_config: SystemConfig, cmd: UserSubcommand) {
    let store = open_store(&system_config);

    match cmd {
        UserSubcommand::Add(cmd) => add(&system_config, &store, cmd),

        UserSubcommand::Rm { address, .. } => {
            let (local, domain) = split_address(&address);
            if let Err(e) = store.delete_user(local, domain) {
                die!(EX_NOUSER, "Failed to delete {}: {}", address, e);
            }
            println!(
                "Deleted {}. The mailbox files remain on disk.",
                address
            );
        },

        UserSubcommand::Passwd {
            prompt_password,
            address,
            ..
        } => {
            let (local, domain) = split_address(&address);
            let (password, generated) = obtain_password(prompt_password);
            if let Err(e) = store.set_password(local, domain, &password) {
                die!(EX_NOUSER, "Failed to update {}: {}", address, e);
            }
            if generated {
                println!("Password: {}", password);
            }
        },

        UserSubcommand::Quota { address, bytes, .. } => {
            let (local, domain) = split_address(&address);
            if let Err(e) = store.set_quota(local, domain, bytes) {
                die!(EX_NOUSER, "Failed to update {}: {}", address, e);
            }
        },

        UserSubcommand::List { domain, .. } => {
            let users = match store.list_users(domain.as_deref()) {
                Ok(users) => users,
                Err(e) => die!(EX_UNAVAILABLE, "Failed to list users: {}", e),
            };

            for user in users {
                println!(
                    "{}@{}\t{}{}",
                    user.local,
                    user.domain,
                    user.used_bytes,
                    if user.active { "" } else { "\t(disabled)" },
                );
            }
        },

        UserSubcommand::Info { address, .. } => {
            let (local, domain) = split_address(&address);
            let user = match store.get_user(local, domain) {
                Ok(Some(user)) => user,
                Ok(None) => die!(EX_NOUSER, "No such user: {}", address),
                Err(e) => {
                    die!(EX_UNAVAILABLE, "Failed to look up user: {}", e)
                },
            };

            let maildir = Maildir::new(
                &system_config.storage.maildir_root,
                domain,
                local,
            );
            println!("Address:\t{}@{}", user.local, user.domain);
            println!("Active: \t{}", user.active);
            println!("Created:\t{}", user.created_at);
            println!("Quota:  \t{} bytes", user.quota_bytes);
            println!("Tracked use:\t{} bytes", user.used_bytes);
            if maildir.exists() {
                println!("On disk:\t{} bytes", maildir.total_size());
            } else {
                println!("On disk:\t(no mailbox yet)");
            }
        },
    }
}

pub(super) fn domain(system_config: SystemConfig, cmd: DomainSubcommand) {
    let store = open_store(&system_config);

    match cmd {
        DomainSubcommand::Add { domain, .. } => {
            if let Err(e) = store.create_domain(&domain) {
                die!(EX_CANTCREAT, "Failed to create {}: {}", domain, e);
            }
        },

        DomainSubcommand::Rm { domain, .. } => {
            if let Err(e) = store.delete_domain(&domain) {
                die!(EX_NOHOST, "Failed to delete {}: {}", domain, e);
            }
            println!(
                "Deleted {} and its accounts. Mailbox files remain on disk.",
                domain
            );
        },

        DomainSubcommand::List { .. } => {
            let domains = match store.list_domains() {
                Ok(domains) => domains,
                Err(e) => {
                    die!(EX_UNAVAILABLE, "Failed to list domains: {}", e)
                },
            };
            for domain in domains {
                println!(
                    "{}{}",
                    domain.domain,
                    if domain.active { "" } else { "\t(disabled)" },
                );
            }
        },
    }
}

fn add(
    system_config: &SystemConfig,
    store: &DirectoryStore,
    cmd: UserAddSubcommand,
) {
    let (local, domain) = split_address(&cmd.address);
    let (password, generated) = obtain_password(cmd.prompt_password);

    if let Err(e) = store.create_user(local, domain, &password, cmd.quota) {
        die!(EX_CANTCREAT, "Failed to create {}: {}", cmd.address, e);
    }

    // Set the mailbox up right away so the first delivery or login doesn't
    // have to
    let maildir =
        Maildir::new(&system_config.storage.maildir_root, domain, local);
    if let Err(e) = maildir.initialize() {
        die!(
            EX_CANTCREAT,
            "Created {}, but initialising its maildir failed: {}",
            cmd.address,
            e
        );
    }

    if generated {
        println!("Password: {}", password);
    }
}

fn open_store(system_config: &SystemConfig) -> DirectoryStore {
    match DirectoryStore::open(&system_config.database.path) {
        Ok(store) => store,
        Err(e) => die!(
            EX_UNAVAILABLE,
            "Unable to open user directory at '{}': {}",
            system_config.database.path.display(),
            e
        ),
    }
}

fn split_address(address: &str) -> (&str, &str) {
    let (local, domain) = parse_userid(address);
    if local.is_empty() || domain.is_empty() {
        die!(EX_USAGE, "Address must have the form user@domain");
    }
    (local, domain)
}

/// Prompt for a password, or generate one. The second element is true when
/// the password was generated and should be shown to the operator.
fn obtain_password(prompt: bool) -> (String, bool) {
    if prompt {
        match rpassword::prompt_password("Password: ").and_then(|a| {
            rpassword::prompt_password("Confirm: ").map(|b| (a, b))
        }) {
            Err(e) => die!(EX_NOINPUT, "Failed to read password: {}", e),
            Ok((a, b)) if a != b => die!(EX_DATAERR, "Passwords don't match"),
            Ok((a, _)) if a.is_empty() => {
                die!(EX_NOINPUT, "No password given")
            },
            Ok((a, _)) => (a, false),
        }
    } else {
        let data: [u8; 8] = OsRng.gen();
        (base64::encode(data), true)
    }
}
