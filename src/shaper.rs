// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Bandwidth, latency and payload shaping for upstream connections.
//!
//! Each proxy instance owns one [`Shaper`]. Its two token buckets (one per
//! direction) are shared by every connection of the instance, and settings
//! are read afresh on every scheduling decision so changes apply to the
//! next chunk of bytes.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Accumulated credit is capped at this much transfer time.
const BURST: Duration = Duration::from_millis(100);
const MIN_CHUNK: usize = 256;
const MAX_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Proxy to server.
    Upstream,
    /// Server to proxy.
    Downstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaperSettings {
    pub enabled: bool,
    pub upstream_kbps: u64,
    pub downstream_kbps: u64,
    pub latency_ms: u64,
    pub payload_percentage: u8,
    pub max_bits_per_second: u64,
}

impl Default for ShaperSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            upstream_kbps: 0,
            downstream_kbps: 0,
            latency_ms: 0,
            payload_percentage: 100,
            max_bits_per_second: 0,
        }
    }
}

impl ShaperSettings {
    /// Effective byte rate for a direction, or `None` when unlimited.
    pub fn bytes_per_second(&self, dir: Direction) -> Option<u64> {
        if !self.enabled {
            return None;
        }
        let kbps = match dir {
            Direction::Upstream => self.upstream_kbps,
            Direction::Downstream => self.downstream_kbps,
        };
        let from_kbps = (kbps > 0).then(|| kbps.saturating_mul(1000) / 8);
        let from_max = (self.max_bits_per_second > 0).then(|| self.max_bits_per_second / 8);
        match (from_kbps, from_max) {
            (Some(a), Some(b)) => Some(a.min(b).max(1)),
            (Some(a), None) | (None, Some(a)) => Some(a.max(1)),
            (None, None) => None,
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        (self.enabled && self.latency_ms > 0).then(|| Duration::from_millis(self.latency_ms))
    }

    /// Number of body bytes to deliver out of `len`.
    pub fn truncated_len(&self, len: usize) -> usize {
        if !self.enabled || self.payload_percentage >= 100 {
            return len;
        }
        (len as u128 * self.payload_percentage as u128 / 100) as usize
    }
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    last: Instant,
}

/// Token bucket that allows debt: a reservation larger than the credit
/// succeeds and the caller waits until the debt is repaid.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBucket {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BucketState {
                available: 0.0,
                last: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("token bucket lock poisoned");
                poisoned.into_inner()
            }
        }
    }

    /// Reserve `bytes` at `rate` bytes/s; returns how long the caller must
    /// wait before transferring them.
    pub fn reserve(&self, bytes: usize, rate: u64) -> Duration {
        let rate = rate.max(1) as f64;
        let mut st = self.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(st.last).as_secs_f64();
        st.last = now;
        let cap = rate * BURST.as_secs_f64();
        st.available = (st.available + elapsed * rate).min(cap);
        st.available -= bytes as f64;
        if st.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-st.available / rate)
        }
    }

    /// Return credit for bytes reserved but not transferred.
    pub fn refund(&self, bytes: usize) {
        if bytes > 0 {
            self.lock().available += bytes as f64;
        }
    }
}

pub struct Shaper {
    settings: RwLock<ShaperSettings>,
    upstream: TokenBucket,
    downstream: TokenBucket,
}

impl Default for Shaper {
    fn default() -> Self {
        Self::new(ShaperSettings::default())
    }
}

impl Shaper {
    pub fn new(settings: ShaperSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            upstream: TokenBucket::new(),
            downstream: TokenBucket::new(),
        }
    }

    pub fn settings(&self) -> ShaperSettings {
        match self.settings.read() {
            Ok(s) => *s,
            Err(poisoned) => {
                warn!("shaper settings lock poisoned during read");
                *poisoned.into_inner()
            }
        }
    }

    fn update<F: FnOnce(&mut ShaperSettings)>(&self, f: F) {
        let mut guard = match self.settings.write() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("shaper settings lock poisoned during write");
                poisoned.into_inner()
            }
        };
        f(&mut guard);
    }

    pub fn set_upstream_kbps(&self, kbps: u64) {
        self.update(|s| s.upstream_kbps = kbps);
    }

    pub fn set_downstream_kbps(&self, kbps: u64) {
        self.update(|s| s.downstream_kbps = kbps);
    }

    pub fn set_latency(&self, ms: u64) {
        self.update(|s| s.latency_ms = ms);
    }

    pub fn set_payload_percentage(&self, pct: u8) -> Result<(), ConfigError> {
        if pct > 100 {
            return Err(ConfigError::parameter(
                "payload_percentage",
                format!("{} is greater than 100", pct),
            ));
        }
        self.update(|s| s.payload_percentage = pct);
        Ok(())
    }

    pub fn set_max_bits_per_second(&self, bps: u64) {
        self.update(|s| s.max_bits_per_second = bps);
    }

    pub fn enable(&self) {
        self.update(|s| s.enabled = true);
        info!(settings = ?self.settings(), "traffic shaping enabled");
    }

    pub fn disable(&self) {
        self.update(|s| s.enabled = false);
        info!("traffic shaping disabled");
    }

    fn bucket(&self, dir: Direction) -> &TokenBucket {
        match dir {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }
}

fn chunk_for(rate: u64) -> usize {
    ((rate / 20) as usize).clamp(MIN_CHUNK, MAX_CHUNK)
}

#[derive(Default)]
struct Pacing {
    grant: usize,
    delay: Option<Pin<Box<Sleep>>>,
}

impl Pacing {
    /// Reserve a chunk if none is pending and wait for it to become sendable.
    /// Returns the number of bytes that may be transferred, or `None` when
    /// the direction is unlimited. A grant whose transfer ends up pending
    /// must be released with [`Pacing::settle`].
    fn poll_grant(
        &mut self,
        cx: &mut Context<'_>,
        shaper: &Shaper,
        dir: Direction,
        want: usize,
    ) -> Poll<Option<usize>> {
        let Some(rate) = shaper.settings().bytes_per_second(dir) else {
            if self.grant > 0 {
                shaper.bucket(dir).refund(self.grant);
            }
            self.grant = 0;
            self.delay = None;
            return Poll::Ready(None);
        };
        if self.grant == 0 {
            let grant = want.min(chunk_for(rate));
            let wait = shaper.bucket(dir).reserve(grant, rate);
            self.grant = grant;
            if !wait.is_zero() {
                self.delay = Some(Box::pin(tokio::time::sleep(wait)));
            }
        }
        if let Some(delay) = self.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }
        Poll::Ready(Some(self.grant.min(want)))
    }

    fn settle(&mut self, shaper: &Shaper, dir: Direction, used: usize) {
        shaper.bucket(dir).refund(self.grant.saturating_sub(used));
        self.grant = 0;
    }
}

/// Byte stream whose reads are paced by the downstream rate and writes by
/// the upstream rate.
pub struct ShapedStream<S> {
    inner: S,
    shaper: Arc<Shaper>,
    read: Pacing,
    write: Pacing,
}

impl<S> ShapedStream<S> {
    pub fn new(inner: S, shaper: Arc<Shaper>) -> Self {
        Self {
            inner,
            shaper,
            read: Pacing::default(),
            write: Pacing::default(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShapedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let want = buf.remaining();
        if want == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let grant = match ready!(this
            .read
            .poll_grant(cx, &this.shaper, Direction::Downstream, want))
        {
            None => return Pin::new(&mut this.inner).poll_read(cx, buf),
            Some(g) => g,
        };

        let dst = buf.initialize_unfilled_to(grant);
        let mut limited = ReadBuf::new(dst);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                buf.advance(n);
                this.read.settle(&this.shaper, Direction::Downstream, n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.read.settle(&this.shaper, Direction::Downstream, 0);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                // idle streams must not hold credit other streams could use
                this.read.settle(&this.shaper, Direction::Downstream, 0);
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShapedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        let grant = match ready!(this
            .write
            .poll_grant(cx, &this.shaper, Direction::Upstream, buf.len()))
        {
            None => return Pin::new(&mut this.inner).poll_write(cx, buf),
            Some(g) => g,
        };
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..grant]) {
            Poll::Ready(Ok(n)) => {
                this.write.settle(&this.shaper, Direction::Upstream, n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.write.settle(&this.shaper, Direction::Upstream, 0);
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                this.write.settle(&this.shaper, Direction::Upstream, 0);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn enabled(upstream: u64, downstream: u64, max_bps: u64) -> ShaperSettings {
        ShaperSettings {
            enabled: true,
            upstream_kbps: upstream,
            downstream_kbps: downstream,
            max_bits_per_second: max_bps,
            ..Default::default()
        }
    }

    #[rstest]
    #[case(enabled(0, 200, 0), Direction::Downstream, Some(25_000))]
    #[case(enabled(0, 200, 0), Direction::Upstream, None)]
    #[case(enabled(0, 200, 80_000), Direction::Downstream, Some(10_000))]
    #[case(enabled(0, 0, 80_000), Direction::Upstream, Some(10_000))]
    #[case(ShaperSettings { enabled: false, ..enabled(8, 8, 8) }, Direction::Downstream, None)]
    fn effective_rate(
        #[case] s: ShaperSettings,
        #[case] dir: Direction,
        #[case] expected: Option<u64>,
    ) {
        assert_eq!(s.bytes_per_second(dir), expected);
    }

    #[test]
    fn huge_rates_saturate_instead_of_overflowing() {
        let s = enabled(u64::MAX, u64::MAX / 100, 0);
        assert_eq!(s.bytes_per_second(Direction::Upstream), Some(u64::MAX / 8));
        assert_eq!(s.bytes_per_second(Direction::Downstream), Some(u64::MAX / 8));
        assert_eq!(
            enabled(u64::MAX, 0, 8_000).bytes_per_second(Direction::Upstream),
            Some(1_000)
        );
        assert_eq!(chunk_for(u64::MAX / 8), MAX_CHUNK);
    }

    #[tokio::test]
    async fn huge_rate_transfers_without_delay() -> anyhow::Result<()> {
        let shaper = Arc::new(Shaper::default());
        shaper.set_downstream_kbps(u64::MAX);
        shaper.enable();
        let elapsed = transfer_through_shaper(shaper, 25_000).await?;
        assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
        Ok(())
    }

    #[rstest]
    #[case(100, 1000, 1000)]
    #[case(50, 1000, 500)]
    #[case(0, 1000, 0)]
    #[case(33, 10, 3)]
    fn payload_truncation(#[case] pct: u8, #[case] len: usize, #[case] expected: usize) {
        let s = ShaperSettings {
            enabled: true,
            payload_percentage: pct,
            ..Default::default()
        };
        assert_eq!(s.truncated_len(len), expected);
    }

    #[test]
    fn truncation_and_latency_need_enabled() {
        let s = ShaperSettings {
            enabled: false,
            payload_percentage: 10,
            latency_ms: 50,
            ..Default::default()
        };
        assert_eq!(s.truncated_len(100), 100);
        assert_eq!(s.latency(), None);
    }

    #[test]
    fn payload_percentage_over_100_is_rejected() {
        let shaper = Shaper::default();
        assert!(shaper.set_payload_percentage(101).is_err());
        assert_eq!(shaper.settings().payload_percentage, 100);
        assert!(shaper.set_payload_percentage(40).is_ok());
        assert_eq!(shaper.settings().payload_percentage, 40);
    }

    #[test]
    fn bucket_debt_translates_to_wait() {
        let bucket = TokenBucket::new();
        let wait = bucket.reserve(1000, 1000);
        assert!(wait > Duration::from_millis(900), "{:?}", wait);
        bucket.refund(1000);
        assert!(bucket.reserve(10, 1000) < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn idle_read_releases_its_reservation() -> anyhow::Result<()> {
        let shaper = Arc::new(Shaper::default());
        // 10_000 B/s, 500 byte chunks
        shaper.set_downstream_kbps(80);
        shaper.enable();
        let (_server, client) = tokio::io::duplex(1024);
        let mut idle = ShapedStream::new(client, shaper.clone());

        // long enough for the first chunk's wait to pass, then the read
        // parks on an empty pipe
        let mut buf = [0u8; 64];
        let parked = tokio::time::timeout(Duration::from_millis(80), idle.read(&mut buf)).await;
        assert!(parked.is_err());

        // a second stream starts with the credit of the elapsed time intact
        let wait = shaper.bucket(Direction::Downstream).reserve(1_000, 10_000);
        assert!(wait <= Duration::from_millis(25), "{:?}", wait);
        Ok(())
    }

    async fn transfer_through_shaper(shaper: Arc<Shaper>, len: usize) -> anyhow::Result<Duration> {
        let (mut server, client) = tokio::io::duplex(64 * 1024);
        let mut shaped = ShapedStream::new(client, shaper);
        let writer = tokio::spawn(async move {
            let data = vec![7u8; len];
            server.write_all(&data).await?;
            server.shutdown().await?;
            Ok::<_, std::io::Error>(())
        });
        let started = Instant::now();
        let mut out = Vec::new();
        shaped.read_to_end(&mut out).await?;
        let elapsed = started.elapsed();
        writer.await??;
        assert_eq!(out.len(), len);
        Ok(elapsed)
    }

    #[tokio::test]
    async fn downstream_limit_bounds_transfer_time() -> anyhow::Result<()> {
        let shaper = Arc::new(Shaper::default());
        shaper.set_downstream_kbps(200);
        shaper.enable();
        // 25_000 bytes at 25_000 B/s, minus at most one burst of credit
        let elapsed = transfer_through_shaper(shaper, 25_000).await?;
        assert!(elapsed >= Duration::from_millis(850), "{:?}", elapsed);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_shaper_does_not_delay() -> anyhow::Result<()> {
        let shaper = Arc::new(Shaper::default());
        shaper.set_downstream_kbps(8);
        let elapsed = transfer_through_shaper(shaper, 25_000).await?;
        assert!(elapsed < Duration::from_millis(500), "{:?}", elapsed);
        Ok(())
    }

    #[tokio::test]
    async fn upstream_writes_are_paced() -> anyhow::Result<()> {
        let shaper = Arc::new(Shaper::default());
        shaper.set_upstream_kbps(80);
        shaper.enable();
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut shaped = ShapedStream::new(client, shaper);
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            server.read_to_end(&mut out).await.map(|_| out.len())
        });
        let started = Instant::now();
        shaped.write_all(&vec![1u8; 5_000]).await?;
        shaped.shutdown().await?;
        let elapsed = started.elapsed();
        assert_eq!(reader.await??, 5_000);
        // 5_000 bytes at 10_000 B/s
        assert!(elapsed >= Duration::from_millis(350), "{:?}", elapsed);
        Ok(())
    }
}
