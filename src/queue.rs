//! Bounded message queues between workers and the guest.
//!
//! Capacities are const generics so every queue lives in static memory.
//! Producers never block past their timeout: a full queue is reported to the
//! caller, which counts a drop instead of stalling its loop.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{with_timeout, Duration};

use crate::config::{RX_QUEUE_DEPTH, TX_QUEUE_DEPTH};
use crate::message::NmeaMessage;

/// Push did not complete within its bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PushTimedOut;

/// Fixed-capacity multi-producer single-consumer queue of messages.
pub struct MessageQueue<const DEPTH: usize> {
    channel: Channel<CriticalSectionRawMutex, NmeaMessage, DEPTH>,
}

/// The shared queue from all rx workers into the guest host.
pub type RxQueue = MessageQueue<RX_QUEUE_DEPTH>;

/// One per-controller queue from the guest host to a tx worker.
pub type TxQueue = MessageQueue<TX_QUEUE_DEPTH>;

impl<const DEPTH: usize> MessageQueue<DEPTH> {
    pub const fn new() -> Self {
        MessageQueue {
            channel: Channel::new(),
        }
    }

    /// Appends `msg`, waiting at most `timeout` for free space.
    pub async fn push_back(&self, msg: NmeaMessage, timeout: Duration) -> Result<(), PushTimedOut> {
        if self.channel.try_send(msg).is_ok() {
            return Ok(());
        }
        with_timeout(timeout, self.channel.send(msg))
            .await
            .map_err(|_| PushTimedOut)
    }

    /// Appends `msg` only if space is free right now.
    pub fn try_push_back(&self, msg: NmeaMessage) -> Result<(), PushTimedOut> {
        self.channel.try_send(msg).map_err(|_| PushTimedOut)
    }

    /// Removes the oldest message, waiting at most `timeout` for one to
    /// arrive. `None` is the consumer's heartbeat tick.
    pub async fn pop_front(&self, timeout: Duration) -> Option<NmeaMessage> {
        if let Ok(msg) = self.channel.try_receive() {
            return Some(msg);
        }
        with_timeout(timeout, self.channel.receive()).await.ok()
    }

    /// Messages currently queued.
    pub fn depth(&self) -> usize {
        self.channel.len()
    }

    /// Compile-time capacity.
    pub const fn capacity(&self) -> usize {
        DEPTH
    }
}

impl<const DEPTH: usize> Default for MessageQueue<DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_time::Duration;

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn push_pop_fifo() {
        let q: MessageQueue<4> = MessageQueue::new();
        block_on(async {
            for pgn in [129025, 129026, 129027] {
                let msg = NmeaMessage::new(0, 6, pgn, 2, &[1]).unwrap();
                q.push_back(msg, SHORT).await.unwrap();
            }
            assert_eq!(q.depth(), 3);
            assert_eq!(q.pop_front(SHORT).await.unwrap().pgn, 129025);
            assert_eq!(q.pop_front(SHORT).await.unwrap().pgn, 129026);
            assert_eq!(q.pop_front(SHORT).await.unwrap().pgn, 129027);
        });
    }

    #[test]
    fn full_queue_times_out_without_losing_contents() {
        let q: MessageQueue<2> = MessageQueue::new();
        block_on(async {
            let msg = NmeaMessage::default();
            q.push_back(msg, SHORT).await.unwrap();
            q.push_back(msg, SHORT).await.unwrap();
            assert_eq!(q.push_back(msg, SHORT).await, Err(PushTimedOut));
            assert_eq!(q.depth(), 2);
        });
    }

    #[test]
    fn empty_pop_times_out() {
        let q: MessageQueue<2> = MessageQueue::new();
        block_on(async {
            assert!(q.pop_front(SHORT).await.is_none());
        });
    }
}
