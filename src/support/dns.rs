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

//! Thin wrapper around the system resolver for the outbound SMTP client.

use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;

pub use hickory_resolver::Name;

pub type Resolver = TokioAsyncResolver;

/// Creates a resolver from the system configuration, falling back to the
/// default public configuration when `/etc/resolv.conf` is unusable.
pub fn system_resolver() -> Resolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
        TokioAsyncResolver::tokio(
            hickory_resolver::config::ResolverConfig::default(),
            hickory_resolver::config::ResolverOpts::default(),
        )
    })
}

/// An entry returned by `lookup_mx`, ordered by `priority` ascending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxRecord {
    pub host: Name,
    pub priority: u16,
}

/// Look up the mail exchanges for `domain`.
///
/// Returns the exchanges sorted most-preferred first. If the domain exists
/// but publishes no MX records, the domain itself is returned as an implicit
/// exchange of priority 0 (the RFC 5321 A-record fallback). A resolution
/// error is an `Err` so the caller can distinguish "no mail system" from
/// "DNS is broken right now".
pub async fn lookup_mx(
    resolver: &Resolver,
    domain: &Name,
) -> Result<Vec<MxRecord>, ()> {
    match resolver.mx_lookup(domain.clone()).await {
        Ok(lookup) => {
            let mut records = lookup
                .iter()
                .map(|mx| MxRecord {
                    host: mx.exchange().clone(),
                    priority: mx.preference(),
                })
                .collect::<Vec<_>>();

            if records.is_empty() {
                records.push(MxRecord {
                    host: domain.clone(),
                    priority: 0,
                });
            }

            records.sort_by_key(|r| r.priority);
            Ok(records)
        },

        Err(e) => match *e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Ok(vec![MxRecord {
                host: domain.clone(),
                priority: 0,
            }]),
            _ => Err(()),
        },
    }
}
