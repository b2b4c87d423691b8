//! Mutual exclusion for the SPI host shared by the two MCP2515s.
//!
//! Four workers (two rx, two tx) contend for one bus. Acquisition is bounded:
//! a worker that cannot get the bus in time records a miss and retries on its
//! next quantum instead of stalling. The critical section is a closure, so
//! release happens on every exit path. Fairness comes from each worker's
//! 10 ms yield between acquisitions, not from the lock itself.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration};

/// The bus could not be acquired within the caller's bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArbiterTimedOut;

/// Exclusive, bounded-wait access to a shared SPI bus.
pub struct SpiArbiter<B> {
    bus: Mutex<CriticalSectionRawMutex, B>,
}

impl<B> SpiArbiter<B> {
    pub const fn new(bus: B) -> Self {
        SpiArbiter {
            bus: Mutex::new(bus),
        }
    }

    /// Runs `f` with the bus held, waiting at most `timeout` to acquire it.
    ///
    /// `f` must be short and non-blocking: it runs a frame-sized SPI
    /// transaction and returns. Queue waits belong outside the section.
    pub async fn with_bus<R>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut B) -> R,
    ) -> Result<R, ArbiterTimedOut> {
        let mut guard = with_timeout(timeout, self.bus.lock())
            .await
            .map_err(|_| ArbiterTimedOut)?;
        Ok(f(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_time::Timer;

    #[test]
    fn contenders_both_progress() {
        let arbiter: SpiArbiter<u32> = SpiArbiter::new(0);
        let bound = Duration::from_millis(100);
        block_on(async {
            let a = async {
                for _ in 0..5 {
                    arbiter.with_bus(bound, |bus| *bus += 1).await.unwrap();
                    Timer::after(Duration::from_millis(2)).await;
                }
            };
            let b = async {
                for _ in 0..5 {
                    arbiter.with_bus(bound, |bus| *bus += 10).await.unwrap();
                    Timer::after(Duration::from_millis(2)).await;
                }
            };
            join(a, b).await;
            let total = arbiter.with_bus(bound, |bus| *bus).await.unwrap();
            assert_eq!(total, 55);
        });
    }
}
