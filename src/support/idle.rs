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

//! The per-connection idle timer.
//!
//! Each protocol server races its command loop against `idle_timer` with
//! `tokio::select!`. The loop pushes a new deadline into the channel after
//! every successful read; when the timer wins the race, the select drops the
//! command loop, which closes the connection.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Completes when `default` elapses without a fresh deadline arriving on
/// `deadline_rx`, or the latest deadline received expires.
///
/// If the sending side goes away the timer never fires; the command loop is
/// about to finish on its own.
pub async fn idle_timer(
    mut deadline_rx: mpsc::Receiver<Instant>,
    default: Duration,
) {
    let mut deadline = Instant::now() + default;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => return,
            received = deadline_rx.recv() => match received {
                Some(new_deadline) => deadline = new_deadline,
                None => std::future::pending::<()>().await,
            },
        }
    }
}
