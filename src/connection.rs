// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Per-client-connection bookkeeping, shared by every exchange carried on
//! the connection (including those inside an intercepted tunnel).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub established: Instant,
    exchanges: AtomicU64,
}

impl ConnectionMetadata {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            established: Instant::now(),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Count one more exchange; returns its 1-based position on the connection.
    pub fn next_exchange(&self) -> u64 {
        self.exchanges.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }

    /// Identifier written to `HarEntry.connection`.
    pub fn har_label(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchanges_are_numbered_from_one() {
        let conn = ConnectionMetadata::new("127.0.0.1:1".parse().expect("addr"));
        assert_eq!(conn.exchanges(), 0);
        assert_eq!(conn.next_exchange(), 1);
        assert_eq!(conn.next_exchange(), 2);
        assert_eq!(conn.exchanges(), 2);
        assert_eq!(conn.har_label(), conn.id.to_string());
    }
}
