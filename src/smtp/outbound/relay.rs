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

use std::time::Duration;

use log::{info, warn};

use super::transact;
use crate::support::dns;

const SMTP_PORT: u16 = 25;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The outcome of attempting to hand one message to one remote recipient.
#[derive(Clone, Debug)]
pub struct DeliveryResult {
    pub success: bool,
    pub error: String,
}

impl DeliveryResult {
    fn failure(error: String) -> Self {
        Self {
            success: false,
            error,
        }
    }
}

/// Deliver `message` from `sender` to the single remote `recipient`.
///
/// The recipient's mail exchanges are resolved and tried most-preferred
/// first; a connection failure or temporary rejection moves on to the next
/// exchange, while a permanent rejection ends the attempt. There is no
/// durable queue: a failed delivery is reported to the caller and otherwise
/// forgotten.
pub async fn deliver_remote(
    resolver: &dns::Resolver,
    local_host_name: &str,
    sender: &str,
    recipient: &str,
    message: &[u8],
) -> DeliveryResult {
    let Some((_, domain)) = recipient.rsplit_once('@') else {
        return DeliveryResult::failure(format!(
            "Invalid recipient address {recipient}"
        ));
    };

    let Ok(domain) = dns::Name::from_str_relaxed(domain) else {
        return DeliveryResult::failure(format!(
            "Unparsable recipient domain in {recipient}"
        ));
    };

    let Ok(mx_records) = dns::lookup_mx(resolver, &domain).await else {
        return DeliveryResult::failure(format!(
            "MX lookup for {domain} failed"
        ));
    };

    let mut last_error =
        format!("No mail exchange for {domain} could be reached");

    for mx in mx_records {
        match try_exchange(&mx, sender, recipient, message, local_host_name)
            .await
        {
            Ok(()) => {
                info!(
                    "Relayed message for {} via {}",
                    recipient, mx.host
                );
                return DeliveryResult {
                    success: true,
                    error: String::new(),
                };
            },

            Err(transact::Error::TotalFailure(error)) => {
                warn!(
                    "Relay of message for {} rejected by {}: {}",
                    recipient, mx.host, error
                );
                return DeliveryResult::failure(error);
            },

            Err(transact::Error::TryNextServer(error)) => {
                warn!(
                    "Relay of message for {} via {} failed: {}",
                    recipient, mx.host, error
                );
                last_error = error;
            },
        }
    }

    DeliveryResult::failure(last_error)
}

async fn try_exchange(
    mx: &dns::MxRecord,
    sender: &str,
    recipient: &str,
    message: &[u8],
    local_host_name: &str,
) -> Result<(), transact::Error> {
    let host = mx.host.to_ascii();
    let host = host.strip_suffix('.').unwrap_or(&host);

    let connect = tokio::time::timeout(
        CONNECT_TIMEOUT,
        tokio::net::TcpStream::connect((host, SMTP_PORT)),
    )
    .await;

    let sock = match connect {
        Ok(Ok(sock)) => sock,
        Ok(Err(e)) => {
            return Err(transact::Error::TryNextServer(format!(
                "Failed to connect to {host}: {e}"
            )));
        },
        Err(_timeout) => {
            return Err(transact::Error::TryNextServer(format!(
                "Timed out connecting to {host}"
            )));
        },
    };

    transact::execute(sock, sender, recipient, message, local_host_name)
        .await
}
