//! Byte-budget throttling for inbound messages.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::core::Throttle;

/// A [`Throttle`] backed by a tokio semaphore counting bytes.
///
/// Requests larger than the whole budget are clamped to the budget so a
/// single oversized message can still pass once everything else drained.
pub struct ByteThrottle {
    name: &'static str,
    sem: Semaphore,
    max: u32,
}

impl ByteThrottle {
    /// Create a throttle with a budget of `max` bytes.
    pub fn new(name: &'static str, max: u64) -> Self {
        let max = u32::try_from(max).unwrap_or(u32::MAX);
        Self {
            name,
            sem: Semaphore::new(max as usize),
            max,
        }
    }

    /// Create a shared throttle.
    pub fn shared(name: &'static str, max: u64) -> Arc<dyn Throttle> {
        Arc::new(Self::new(name, max))
    }

    fn clamp(&self, n: u64) -> u32 {
        u32::try_from(n).unwrap_or(u32::MAX).min(self.max)
    }
}

impl fmt::Debug for ByteThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteThrottle")
            .field("name", &self.name)
            .field("current", &self.current())
            .field("max", &self.max)
            .finish()
    }
}

#[async_trait]
impl Throttle for ByteThrottle {
    async fn acquire(&self, n: u64) -> bool {
        let take = self.clamp(n);
        if take == 0 {
            return false;
        }
        if let Ok(permit) = self.sem.try_acquire_many(take) {
            permit.forget();
            return false;
        }

        tracing::debug!(throttle = self.name, want = take, current = self.current(), "waiting for budget");
        if let Ok(permit) = self.sem.acquire_many(take).await {
            permit.forget();
        }
        true
    }

    fn release(&self, n: u64) {
        let give = self.clamp(n);
        self.sem.add_permits(give as usize);
    }

    fn current(&self) -> u64 {
        u64::from(self.max).saturating_sub(self.sem.available_permits() as u64)
    }

    fn max(&self) -> u64 {
        u64::from(self.max)
    }
}

/// Bytes held against a throttle, returned when dropped.
pub struct ThrottleReservation {
    throttle: Arc<dyn Throttle>,
    bytes: u64,
}

impl ThrottleReservation {
    /// Record that `bytes` were acquired from `throttle`.
    pub fn new(throttle: Arc<dyn Throttle>, bytes: u64) -> Self {
        Self { throttle, bytes }
    }

    /// Reserved byte count.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl fmt::Debug for ThrottleReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThrottleReservation({} bytes)", self.bytes)
    }
}

impl Drop for ThrottleReservation {
    fn drop(&mut self) {
        self.throttle.release(self.bytes);
    }
}
