//! Single-slot rendezvous between a producer thread and a consumer thread.
//!
//! The producer publishes scratch info under the slot mutex, wakes the
//! consumer through a bounded channel and waits on a condition variable until
//! the consumer has incremented the completion counter. Only one producer wait
//! may be outstanding; a second concurrent round trip is rejected with
//! [`HandoffError::Busy`].
//!
//! There is no timeout: a consumer that is alive but never completes stalls
//! the producer. A consumer that goes away (receiver dropped, or a pending
//! request dropped without completion) releases the producer with
//! [`HandoffError::Disconnected`].

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("a handoff round trip is already in flight")]
    Busy,
    #[error("handoff consumer disconnected")]
    Disconnected,
}

#[derive(Debug)]
struct Slot<Info, Reply> {
    completed: i32,
    in_flight: bool,
    in_service: bool,
    consumer_gone: bool,
    info: Option<Info>,
    reply: Option<Reply>,
}

#[derive(Debug)]
struct Shared<Info, Reply> {
    slot: Mutex<Slot<Info, Reply>>,
    completed_cond: Condvar,
}

impl<Info, Reply> Shared<Info, Reply> {
    fn complete(&self, reply: Option<Reply>) {
        let mut slot = self.slot.lock();
        slot.reply = reply;
        slot.in_service = false;
        slot.completed += 1;
        self.completed_cond.notify_one();
    }
}

pub fn handoff_channel<Signal, Info, Reply>() -> (
    HandoffProducer<Signal, Info, Reply>,
    HandoffConsumer<Signal, Info, Reply>,
) {
    let (signal_sender, signal_receiver) = bounded(1);
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            completed: 0,
            in_flight: false,
            in_service: false,
            consumer_gone: false,
            info: None,
            reply: None,
        }),
        completed_cond: Condvar::new(),
    });
    (
        HandoffProducer {
            shared: shared.clone(),
            signal_sender,
        },
        HandoffConsumer {
            shared,
            signal_receiver,
        },
    )
}

#[derive(Debug)]
pub struct HandoffProducer<Signal, Info, Reply> {
    shared: Arc<Shared<Info, Reply>>,
    signal_sender: Sender<Signal>,
}

impl<Signal, Info, Reply> HandoffProducer<Signal, Info, Reply> {
    /// Publishes `info`, wakes the consumer with `signal` and blocks until the
    /// consumer completes the request.
    pub fn round_trip(&self, signal: Signal, info: Info) -> Result<Reply, HandoffError> {
        let mut slot = self.shared.slot.lock();
        if slot.in_flight {
            return Err(HandoffError::Busy);
        }
        if slot.consumer_gone {
            return Err(HandoffError::Disconnected);
        }
        slot.in_flight = true;
        slot.info = Some(info);
        slot.reply = None;

        match self.signal_sender.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                slot.in_flight = false;
                slot.info = None;
                return Err(HandoffError::Busy);
            }
            Err(TrySendError::Disconnected(_)) => {
                slot.in_flight = false;
                slot.info = None;
                return Err(HandoffError::Disconnected);
            }
        }

        while slot.completed <= 0 && !slot.consumer_gone {
            self.shared.completed_cond.wait(&mut slot);
        }
        slot.in_flight = false;
        if slot.completed <= 0 {
            slot.info = None;
            return Err(HandoffError::Disconnected);
        }
        slot.completed -= 1;
        slot.reply.take().ok_or(HandoffError::Disconnected)
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.slot.lock().in_flight
    }
}

#[derive(Debug)]
pub struct HandoffConsumer<Signal, Info, Reply> {
    shared: Arc<Shared<Info, Reply>>,
    signal_receiver: Receiver<Signal>,
}

impl<Signal, Info, Reply> HandoffConsumer<Signal, Info, Reply> {
    /// Blocks until the producer signals. `None` once the producer is dropped.
    pub fn recv(&self) -> Option<PendingHandoff<Signal, Info, Reply>> {
        let signal = self.signal_receiver.recv().ok()?;
        Some(self.take_pending(signal))
    }

    pub fn try_recv(&self) -> Option<PendingHandoff<Signal, Info, Reply>> {
        let signal = self.signal_receiver.try_recv().ok()?;
        Some(self.take_pending(signal))
    }

    fn take_pending(&self, signal: Signal) -> PendingHandoff<Signal, Info, Reply> {
        let info = {
            let mut slot = self.shared.slot.lock();
            slot.in_service = true;
            slot.info
                .take()
                .expect("handoff signal must be preceded by published info")
        };
        PendingHandoff {
            shared: self.shared.clone(),
            signal: Some(signal),
            info: Some(info),
            completed: false,
        }
    }
}

impl<Signal, Info, Reply> Drop for HandoffConsumer<Signal, Info, Reply> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock();
        if slot.in_service {
            // The outstanding PendingHandoff releases the producer itself.
            return;
        }
        slot.consumer_gone = true;
        self.shared.completed_cond.notify_all();
    }
}

/// A request taken by the consumer. Must be completed; dropping it releases
/// the producer with [`HandoffError::Disconnected`].
#[derive(Debug)]
pub struct PendingHandoff<Signal, Info, Reply> {
    shared: Arc<Shared<Info, Reply>>,
    signal: Option<Signal>,
    info: Option<Info>,
    completed: bool,
}

impl<Signal, Info, Reply> PendingHandoff<Signal, Info, Reply> {
    pub fn signal(&self) -> &Signal {
        self.signal.as_ref().expect("pending handoff signal")
    }

    pub fn info(&self) -> &Info {
        self.info.as_ref().expect("pending handoff info")
    }

    pub fn complete(mut self, reply: Reply) {
        self.completed = true;
        self.shared.complete(Some(reply));
    }
}

impl<Signal, Info, Reply> Drop for PendingHandoff<Signal, Info, Reply> {
    fn drop(&mut self) {
        if !self.completed {
            self.shared.complete(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Wake {
        Double,
        Drop,
    }

    #[test]
    fn round_trip_returns_consumer_reply() {
        let (producer, consumer) = handoff_channel::<Wake, u32, u32>();
        let consumer_thread = thread::spawn(move || {
            let mut served = 0;
            while let Some(pending) = consumer.recv() {
                assert_eq!(*pending.signal(), Wake::Double);
                let value = *pending.info();
                pending.complete(value * 2);
                served += 1;
            }
            served
        });

        for value in 0..50 {
            assert_eq!(producer.round_trip(Wake::Double, value), Ok(value * 2));
        }
        drop(producer);
        assert_eq!(consumer_thread.join().expect("consumer thread"), 50);
    }

    #[test]
    fn overlapping_round_trip_is_busy() {
        let (producer, consumer) = handoff_channel::<Wake, u32, u32>();
        let producer = Arc::new(producer);
        let waiting = producer.clone();
        let first = thread::spawn(move || waiting.round_trip(Wake::Double, 21));

        while !producer.is_in_flight() {
            thread::yield_now();
        }
        assert_eq!(
            producer.round_trip(Wake::Double, 1),
            Err(HandoffError::Busy)
        );

        let pending = consumer.recv().expect("pending");
        let value = *pending.info();
        pending.complete(value * 2);
        assert_eq!(first.join().expect("first producer"), Ok(42));
    }

    #[test]
    fn dropped_pending_request_releases_producer() {
        let (producer, consumer) = handoff_channel::<Wake, u32, u32>();
        let consumer_thread = thread::spawn(move || {
            let pending = consumer.recv().expect("pending");
            assert_eq!(*pending.signal(), Wake::Drop);
            drop(pending);
        });

        assert_eq!(
            producer.round_trip(Wake::Drop, 0),
            Err(HandoffError::Disconnected)
        );
        consumer_thread.join().expect("consumer thread");
    }

    #[test]
    fn dropped_consumer_releases_waiting_producer() {
        let (producer, consumer) = handoff_channel::<Wake, u32, u32>();
        let producer_thread = thread::spawn(move || producer.round_trip(Wake::Double, 3));
        thread::sleep(Duration::from_millis(20));
        drop(consumer);
        assert_eq!(
            producer_thread.join().expect("producer thread"),
            Err(HandoffError::Disconnected)
        );
    }

    #[test]
    fn round_trip_after_consumer_drop_fails_fast() {
        let (producer, consumer) = handoff_channel::<Wake, u32, u32>();
        drop(consumer);
        assert_eq!(
            producer.round_trip(Wake::Double, 1),
            Err(HandoffError::Disconnected)
        );
        assert!(!producer.is_in_flight());
    }
}
