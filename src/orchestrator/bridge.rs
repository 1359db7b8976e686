//! Ordered delivery of worker events to the interactive thread.

use crate::model::AppEvent;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Sending half. Cheap to clone and callable from any thread; posting never
/// blocks and never runs the consumer.
#[derive(Debug, Clone)]
pub struct EventBridge {
    tx: UnboundedSender<AppEvent>,
}

/// Receiving half, owned by the interactive thread.
#[derive(Debug)]
pub struct EventReceiver {
    rx: UnboundedReceiver<AppEvent>,
}

/// Create a connected bridge. Events from one sender arrive in post order.
pub fn channel() -> (EventBridge, EventReceiver) {
    // Unbounded so a fast engine never stalls on a slow UI.
    let (tx, rx) = mpsc::unbounded_channel();
    (EventBridge { tx }, EventReceiver { rx })
}

impl EventBridge {
    pub fn post(&self, event: AppEvent) {
        // The consumer is gone only while the app is shutting down.
        let _ = self.tx.send(event);
    }

    pub fn post_log(&self, text: impl Into<String>) {
        self.post(AppEvent::Log(text.into()));
    }

    pub fn post_progress(&self, item: impl Into<String>, total: u64) {
        self.post(AppEvent::Progress {
            item: item.into(),
            total,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventReceiver {
    /// Wait for the next event; `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<AppEvent> {
        self.rx.recv().await
    }

    /// Take one pending event without waiting.
    pub fn try_recv(&mut self) -> Option<AppEvent> {
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&mut self) -> Vec<AppEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_from_another_thread_keep_their_order() {
        let (bridge, mut rx) = channel();
        let worker = std::thread::spawn(move || {
            for i in 0..200u64 {
                if i % 2 == 0 {
                    bridge.post_log(format!("line {i}"));
                } else {
                    bridge.post_progress(format!("img{i}.jpg"), 200);
                }
            }
        });
        worker.join().unwrap();

        let got = rx.drain();
        assert_eq!(got.len(), 200);
        for (i, ev) in got.into_iter().enumerate() {
            let expected = if i % 2 == 0 {
                AppEvent::Log(format!("line {i}"))
            } else {
                AppEvent::Progress {
                    item: format!("img{i}.jpg"),
                    total: 200,
                }
            };
            assert_eq!(ev, expected);
        }
    }

    #[test]
    fn posting_after_receiver_dropped_is_harmless() {
        let (bridge, rx) = channel();
        drop(rx);
        assert!(bridge.is_closed());
        bridge.post_log("nobody listening");
    }
}
