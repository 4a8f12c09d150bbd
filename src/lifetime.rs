use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http::Uri;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tower_service::Service;

use crate::error::BoxError;
use crate::util::lock_unpoisoned;

/// Outcome of releasing a connection back to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    Keep,
    Discard,
}

/// Tracks how long one physical connection has been active.
///
/// Activation happens once, when the connection is established. Every
/// release compares the elapsed time with the TTL; without a TTL the
/// connection is always kept.
#[derive(Clone, Debug)]
pub struct ConnectionLifetimeTracker {
    ttl: Option<Duration>,
    activated_at: Option<Instant>,
}

impl ConnectionLifetimeTracker {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            activated_at: None,
        }
    }

    /// Returns `false` if the connection was already active.
    pub fn activate(&mut self, now: Instant) -> bool {
        if self.activated_at.is_some() {
            return false;
        }
        self.activated_at = Some(now);
        true
    }

    pub fn deactivate(&mut self) {
        self.activated_at = None;
    }

    pub fn is_active(&self) -> bool {
        self.activated_at.is_some()
    }

    pub fn release(&self, now: Instant) -> Release {
        let (Some(ttl), Some(activated_at)) = (self.ttl, self.activated_at) else {
            return Release::Keep;
        };
        if now.saturating_duration_since(activated_at) > ttl {
            Release::Discard
        } else {
            Release::Keep
        }
    }
}

/// Shared handle to a connection's tracker, carried in the connection
/// metadata so the executor can find it after a response completes.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionLifetime {
    tracker: Arc<Mutex<ConnectionLifetimeTracker>>,
}

impl ConnectionLifetime {
    fn activated(ttl: Option<Duration>) -> Self {
        let mut tracker = ConnectionLifetimeTracker::new(ttl);
        tracker.activate(Instant::now());
        Self {
            tracker: Arc::new(Mutex::new(tracker)),
        }
    }

    /// A discarded connection is deactivated, so later releases of the same
    /// connection report `Keep` and the discard is counted once.
    pub(crate) fn release(&self, now: Instant) -> Release {
        let mut tracker = lock_unpoisoned(&self.tracker);
        let outcome = tracker.release(now);
        if outcome == Release::Discard {
            tracker.deactivate();
        }
        outcome
    }
}

#[derive(Debug)]
pub(crate) struct TrackedConnection<T> {
    inner: T,
    lifetime: ConnectionLifetime,
}

impl<T> HyperRead for TrackedConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for TrackedConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write_vectored(cx, bufs)
    }
}

impl<T> Connection for TrackedConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.inner.connected().extra(self.lifetime.clone())
    }
}

/// TCP connector that attaches a [`ConnectionLifetimeTracker`] to every new
/// connection.
#[derive(Clone)]
pub(crate) struct LifetimeConnector {
    direct: HttpConnector,
    ttl: Option<Duration>,
}

impl LifetimeConnector {
    pub(crate) fn new(connect_timeout: Duration, ttl: Option<Duration>) -> Self {
        let mut direct = HttpConnector::new();
        direct.enforce_http(false);
        direct.set_connect_timeout(Some(connect_timeout));
        direct.set_nodelay(true);
        Self { direct, ttl }
    }
}

impl Service<Uri> for LifetimeConnector {
    type Response = TrackedConnection<<HttpConnector as Service<Uri>>::Response>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self.direct.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connecting = self.direct.call(dst);
        let ttl = self.ttl;
        Box::pin(async move {
            connecting
                .await
                .map(|inner| TrackedConnection {
                    inner,
                    lifetime: ConnectionLifetime::activated(ttl),
                })
                .map_err(|error| Box::new(error) as _)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_past_ttl_is_discarded_on_release() {
        let start = Instant::now();
        let mut tracker = ConnectionLifetimeTracker::new(Some(Duration::from_millis(100)));
        assert!(tracker.activate(start));
        assert_eq!(
            tracker.release(start + Duration::from_millis(150)),
            Release::Discard
        );
    }

    #[test]
    fn connection_within_ttl_is_kept() {
        let start = Instant::now();
        let mut tracker = ConnectionLifetimeTracker::new(Some(Duration::from_millis(100)));
        tracker.activate(start);
        assert_eq!(tracker.release(start + Duration::from_millis(100)), Release::Keep);
        assert_eq!(tracker.release(start + Duration::from_millis(40)), Release::Keep);
    }

    #[test]
    fn connection_without_ttl_is_always_kept() {
        let start = Instant::now();
        let mut tracker = ConnectionLifetimeTracker::new(None);
        tracker.activate(start);
        assert_eq!(
            tracker.release(start + Duration::from_secs(3600)),
            Release::Keep
        );
    }

    #[test]
    fn activation_is_not_repeated_until_deactivated() {
        let start = Instant::now();
        let later = start + Duration::from_millis(500);
        let mut tracker = ConnectionLifetimeTracker::new(Some(Duration::from_millis(100)));
        assert!(tracker.activate(start));
        assert!(!tracker.activate(later));
        assert_eq!(tracker.release(later), Release::Discard);

        tracker.deactivate();
        assert!(!tracker.is_active());
        assert!(tracker.activate(later));
        assert_eq!(tracker.release(later), Release::Keep);
    }

    #[test]
    fn shared_lifetime_discards_once_then_goes_inactive() {
        let lifetime = ConnectionLifetime::activated(Some(Duration::ZERO));
        let later = Instant::now() + Duration::from_millis(1);
        assert!(lock_unpoisoned(&lifetime.tracker).is_active());
        assert_eq!(lifetime.release(later), Release::Discard);
        assert!(!lock_unpoisoned(&lifetime.tracker).is_active());
        assert_eq!(lifetime.release(later), Release::Keep);
    }

    #[test]
    fn inactive_connection_is_kept() {
        let tracker = ConnectionLifetimeTracker::new(Some(Duration::ZERO));
        assert_eq!(tracker.release(Instant::now()), Release::Keep);
    }
}
