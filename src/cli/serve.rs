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

//! The `serve` entry point: bind every listener, accept, dispatch.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::net::{TcpListener, TcpStream};

use crate::{
    auth::DirectoryStore,
    imap, pop3, smtp,
    support::{
        async_io::ServerIo, dns, log_prefix::LogPrefix,
        system_config::SystemConfig,
    },
};

// Need to use this and not die! so that errors go to syslog/etc
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) fn serve(system_config: SystemConfig, system_root: PathBuf) {
    let worker_threads = system_config.server.worker_threads.max(1);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => fatal!(EX_OSERR, "Failed to start runtime: {}", e),
    };

    runtime.block_on(serve_impl(system_config, system_root));
}

/// What one listener hands its connections to.
#[derive(Clone, Copy, Debug)]
enum Service {
    Smtp {
        require_auth: bool,
        allow_relay: bool,
        implicit_tls: bool,
    },
    Pop3 {
        implicit_tls: bool,
    },
    Imap {
        implicit_tls: bool,
    },
}

impl Service {
    fn protocol(self) -> &'static str {
        match self {
            Service::Smtp { .. } => "smtp",
            Service::Pop3 { .. } => "pop3",
            Service::Imap { .. } => "imap",
        }
    }

    fn implicit_tls(self) -> bool {
        match self {
            Service::Smtp { implicit_tls, .. }
            | Service::Pop3 { implicit_tls }
            | Service::Imap { implicit_tls } => implicit_tls,
        }
    }
}

/// State shared by every listener.
struct Shared {
    system_config: SystemConfig,
    host_name: String,
    store: Arc<DirectoryStore>,
    ssl_acceptor: Option<Arc<SslAcceptor>>,
    smtp_ctx: Arc<smtp::inbound::Context>,
    pop3_ctx: Arc<pop3::Context>,
    imap_ctx: Arc<imap::Context>,
}

async fn serve_impl(system_config: SystemConfig, system_root: PathBuf) {
    let host_name = resolve_host_name(&system_config);

    let ssl_acceptor = system_config.tls.as_ref().map(|tls_config| {
        Arc::new(create_ssl_acceptor(
            &system_root,
            &tls_config.private_key,
            &tls_config.certificate_chain,
        ))
    });
    if ssl_acceptor.is_none() {
        warn!(
            "No [tls] configuration; serving cleartext only, \
             without STARTTLS/STLS"
        );
    }

    let store =
        match DirectoryStore::open(&system_config.database.path) {
            Ok(store) => Arc::new(store),
            Err(e) => fatal!(
                EX_UNAVAILABLE,
                "Unable to open user directory at '{}': {}",
                system_config.database.path.display(),
                e
            ),
        };

    let idle_timeout =
        Duration::from_secs(system_config.server.idle_timeout_secs);

    let shared = Arc::new(Shared {
        host_name: host_name.clone(),
        store: Arc::clone(&store),
        ssl_acceptor: ssl_acceptor.clone(),
        smtp_ctx: Arc::new(smtp::inbound::Context {
            store: Arc::clone(&store),
            maildir_root: system_config.storage.maildir_root.clone(),
            resolver: Arc::new(dns::system_resolver()),
            ssl_acceptor: ssl_acceptor.clone(),
            host_name,
            idle_timeout,
        }),
        pop3_ctx: Arc::new(pop3::Context {
            ssl_acceptor: ssl_acceptor.clone(),
            idle_timeout,
        }),
        imap_ctx: Arc::new(imap::Context {
            ssl_acceptor,
            idle_timeout,
        }),
        system_config,
    });

    let smtp = &shared.system_config.smtp;
    let mut listeners = vec![
        (
            smtp.port,
            Service::Smtp {
                require_auth: smtp.require_auth,
                allow_relay: smtp.allow_relay,
                implicit_tls: false,
            },
        ),
        (
            smtp.submission_port,
            // Submission always demands authentication and relays for
            // whoever authenticates
            Service::Smtp {
                require_auth: true,
                allow_relay: true,
                implicit_tls: false,
            },
        ),
        (shared.system_config.pop3.port, Service::Pop3 {
            implicit_tls: false,
        }),
        (shared.system_config.imap.port, Service::Imap {
            implicit_tls: false,
        }),
    ];

    if shared.ssl_acceptor.is_some() {
        listeners.push((smtp.tls_port, Service::Smtp {
            require_auth: true,
            allow_relay: true,
            implicit_tls: true,
        }));
        listeners.push((shared.system_config.pop3.tls_port, Service::Pop3 {
            implicit_tls: true,
        }));
        listeners.push((shared.system_config.imap.tls_port, Service::Imap {
            implicit_tls: true,
        }));
    }

    for (port, service) in listeners {
        let bind_address = shared.system_config.server.bind_address.clone();
        let listener =
            match TcpListener::bind((bind_address.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => fatal!(
                    EX_UNAVAILABLE,
                    "Failed to bind {} listener on {}:{}: {}",
                    service.protocol(),
                    bind_address,
                    port,
                    e
                ),
            };

        info!(
            "Listening for {}{} on {}:{}",
            service.protocol(),
            if service.implicit_tls() { "s" } else { "" },
            bind_address,
            port,
        );
        tokio::spawn(accept_loop(listener, Arc::clone(&shared), service));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted; shutting down"),
        Err(e) => fatal!(EX_OSERR, "Failed to wait for shutdown signal: {}", e),
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    service: Service,
) {
    loop {
        match listener.accept().await {
            Ok((sock, addr)) => {
                tokio::spawn(handle_connection(
                    Arc::clone(&shared),
                    service,
                    sock,
                    addr,
                ));
            },

            Err(e) => {
                // Usually transient (EMFILE and friends); don't spin
                warn!("{} accept failed: {}", service.protocol(), e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    service: Service,
    sock: TcpStream,
    addr: SocketAddr,
) {
    let log_prefix =
        LogPrefix::new(format!("{}:{}", service.protocol(), addr));
    info!("{} Connection established", log_prefix);

    let _ = sock.set_nodelay(true);
    let sock = match sock.into_std() {
        Ok(sock) => sock,
        Err(e) => {
            warn!("{} Failed to configure socket: {}", log_prefix, e);
            return;
        },
    };
    let io = match ServerIo::new_owned_socket(sock) {
        Ok(io) => io,
        Err(e) => {
            warn!("{} Failed to configure socket: {}", log_prefix, e);
            return;
        },
    };

    if service.implicit_tls() {
        let acceptor = shared
            .ssl_acceptor
            .as_ref()
            .expect("implicit-TLS listener without an acceptor");
        match tokio::time::timeout(
            TLS_HANDSHAKE_TIMEOUT,
            io.ssl_accept(acceptor),
        )
        .await
        {
            Ok(Ok(())) => {
                info!("{} TLS handshake succeeded", log_prefix);
            },
            Ok(Err(e)) => {
                warn!("{} TLS handshake failed: {}", log_prefix, e);
                return;
            },
            Err(_timeout) => {
                warn!("{} TLS handshake timed out", log_prefix);
                return;
            },
        }
    }

    let starttls_available =
        shared.ssl_acceptor.is_some() && !service.implicit_tls();

    let result = match service {
        Service::Smtp {
            require_auth,
            allow_relay,
            implicit_tls,
        } => {
            let session = smtp::inbound::Session::new(
                smtp::inbound::SessionParams {
                    log_prefix: log_prefix.clone(),
                    store: Arc::clone(&shared.store),
                    host_name: shared.host_name.clone(),
                    peer: addr.ip().to_string(),
                    local_domains: shared
                        .system_config
                        .smtp
                        .local_domains
                        .clone(),
                    max_message_size: shared
                        .system_config
                        .smtp
                        .max_message_size,
                    max_recipients: shared.system_config.smtp.max_recipients,
                    require_auth,
                    allow_relay,
                    starttls_available,
                    tls_active: implicit_tls,
                },
            );
            smtp::inbound::run(
                io,
                Arc::clone(&shared.smtp_ctx),
                log_prefix.clone(),
                session,
            )
            .await
        },

        Service::Pop3 { implicit_tls } => {
            let session = pop3::Session::new(pop3::SessionParams {
                log_prefix: log_prefix.clone(),
                store: Arc::clone(&shared.store),
                maildir_root: shared
                    .system_config
                    .storage
                    .maildir_root
                    .clone(),
                host_name: shared.host_name.clone(),
                stls_available: starttls_available,
                tls_active: implicit_tls,
            });
            pop3::run(
                io,
                Arc::clone(&shared.pop3_ctx),
                log_prefix.clone(),
                session,
            )
            .await
        },

        Service::Imap { implicit_tls } => {
            let session = imap::Session::new(imap::SessionParams {
                log_prefix: log_prefix.clone(),
                store: Arc::clone(&shared.store),
                maildir_root: shared
                    .system_config
                    .storage
                    .maildir_root
                    .clone(),
                host_name: shared.host_name.clone(),
                starttls_available,
                tls_active: implicit_tls,
            });
            imap::run(
                io,
                Arc::clone(&shared.imap_ctx),
                log_prefix.clone(),
                session,
            )
            .await
        },
    };

    match result {
        Ok(()) => info!("{} Normal client disconnect", log_prefix),
        Err(e) => warn!("{} Abnormal client disconnect: {}", log_prefix, e),
    }
}

fn resolve_host_name(system_config: &SystemConfig) -> String {
    if !system_config.server.host_name.is_empty() {
        return system_config.server.host_name.clone();
    }

    let host_name = nix::unistd::gethostname().unwrap_or_else(|e| {
        fatal!(
            EX_OSERR,
            "Failed to determine host name; you may need to \
             explicitly configure it: {}",
            e
        )
    });
    host_name
        .into_string()
        .unwrap_or_else(|_| fatal!(EX_OSERR, "System host name is not UTF-8"))
}

fn create_ssl_acceptor(
    system_root: &Path,
    private_key: &Path,
    certificate_chain: &Path,
) -> SslAcceptor {
    let mut acceptor =
        match SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()) {
            Ok(a) => a,
            Err(e) => fatal!(
                EX_SOFTWARE,
                "Failed to initialise OpenSSL acceptor: {}",
                e
            ),
        };

    let private_key_path = system_root.join(private_key);
    if let Err(e) =
        acceptor.set_private_key_file(&private_key_path, SslFiletype::PEM)
    {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS private key from '{}': {}",
            private_key_path.display(),
            e
        );
    }

    let certificate_path = system_root.join(certificate_chain);
    if let Err(e) = acceptor.set_certificate_chain_file(&certificate_path) {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS certificate chain from '{}': {}",
            certificate_path.display(),
            e
        );
    }

    if let Err(e) = acceptor.check_private_key() {
        fatal!(EX_CONFIG, "TLS key seems to be invalid: {}", e);
    }

    acceptor.build()
}
