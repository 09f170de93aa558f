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

use std::fs;
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run the mail server.
    ///
    /// Binds the configured SMTP, POP3 and IMAP listeners and serves until
    /// interrupted.
    Serve(CommonOptions),
    /// Manage user accounts.
    User(UserSubcommand),
    /// Manage mail domains.
    Domain(DomainSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `tridove.toml` etc
    /// [default: /etc/tridove or /usr/local/etc/tridove]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) enum UserSubcommand {
    /// Create a new user account.
    Add(UserAddSubcommand),
    /// Delete a user account. The on-disk mailbox is left behind.
    Rm {
        #[structopt(flatten)]
        common: CommonOptions,

        /// The address (user@domain) to delete.
        address: String,
    },
    /// Change a user's password.
    Passwd {
        #[structopt(flatten)]
        common: CommonOptions,

        /// Prompt for the password instead of generating one.
        #[structopt(long)]
        prompt_password: bool,

        /// The address (user@domain) to update.
        address: String,
    },
    /// List user accounts.
    List {
        #[structopt(flatten)]
        common: CommonOptions,

        /// Only list users of this domain.
        #[structopt(long)]
        domain: Option<String>,
    },
    /// Change a user's quota. Tracked, not enforced.
    Quota {
        #[structopt(flatten)]
        common: CommonOptions,

        /// The address (user@domain) to update.
        address: String,

        /// The new quota in bytes.
        bytes: i64,
    },
    /// Show one user's record.
    Info {
        #[structopt(flatten)]
        common: CommonOptions,

        /// The address (user@domain) to inspect.
        address: String,
    },
}

#[derive(StructOpt)]
pub(super) struct UserAddSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Prompt for the password instead of generating one.
    #[structopt(long)]
    pub(super) prompt_password: bool,

    /// Quota in bytes. Tracked, not enforced.
    #[structopt(long, default_value = crate::auth::DEFAULT_QUOTA_BYTES_STR)]
    pub(super) quota: i64,

    /// The address (user@domain) to create. The domain is created on
    /// demand.
    pub(super) address: String,
}

#[derive(StructOpt)]
pub(super) enum DomainSubcommand {
    /// Register a domain as locally deliverable.
    Add {
        #[structopt(flatten)]
        common: CommonOptions,

        domain: String,
    },
    /// Delete a domain and every account in it.
    Rm {
        #[structopt(flatten)]
        common: CommonOptions,

        domain: String,
    },
    /// List registered domains.
    List {
        #[structopt(flatten)]
        common: CommonOptions,
    },
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Serve(ref mut c) => mem::take(c),
            Command::User(UserSubcommand::Add(ref mut c)) => {
                mem::take(&mut c.common)
            },
            Command::User(
                UserSubcommand::Rm { ref mut common, .. }
                | UserSubcommand::Passwd { ref mut common, .. }
                | UserSubcommand::List { ref mut common, .. }
                | UserSubcommand::Quota { ref mut common, .. }
                | UserSubcommand::Info { ref mut common, .. },
            ) => mem::take(common),
            Command::Domain(
                DomainSubcommand::Add { ref mut common, .. }
                | DomainSubcommand::Rm { ref mut common, .. }
                | DomainSubcommand::List { ref mut common },
            ) => mem::take(common),
        }
    }
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more
    // concise API
    let mut cmd = Command::from_clap(&match Command::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    let common = cmd.common_options();
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/tridove/tridove.toml").is_file() {
            "/etc/tridove".to_owned().into()
        } else if Path::new("/usr/local/etc/tridove/tridove.toml").is_file() {
            "/usr/local/etc/tridove".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/tridove nor /usr/local/etc/tridove looks like\n\
                 the Tridove root; use --root=/path/to/tridove if your\n\
                 installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("tridove.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        eprintln!("Error reading '{}': {}", system_config_path.display(), e);
        EX_CONFIG.exit();
    }

    let system_config: SystemConfig =
        match toml::from_slice(&system_config_toml) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    system_config_path.display(),
                    e
                );
                EX_CONFIG.exit()
            },
        };

    init_logging(&root, matches!(cmd, Command::Serve(..)));

    match cmd {
        Command::Serve(_) => {
            super::serve::serve(system_config, root);
        },
        Command::User(cmd) => super::user::user(system_config, cmd),
        Command::Domain(cmd) => super::user::domain(system_config, cmd),
    }
}

fn init_logging(root: &Path, daemon: bool) {
    if !daemon || Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just
        // write to stderr.
        crate::init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        log4rs::init_file(log_config_file, log4rs::config::Deserializers::new())
            .expect("Failed to initialise logging");
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw() as u32,
        };

        let logger =
            syslog::unix(formatter).expect("Failed to connect to syslog");
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|_| log::set_max_level(log::LevelFilter::Info))
            .expect("Failed to initialise logging");
    }
}
