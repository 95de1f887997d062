//! Single-consumer FIFO serializing all inbound handling.
//!
//! Producers (the network task, poll timers) push decoded items; exactly one
//! consumer thread pops and fully handles one item before the next. Control
//! messages ride the same queue as commands, so a `config` is always handled
//! before any command that arrived after it, and the network task never
//! waits on the server lock. A failing or panicking item is logged and the
//! consumer keeps draining.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{PolyError, PolyResult};
use crate::protocol::Inbound;

/// Create a connected sender/receiver pair.
pub fn dispatch_queue() -> (DispatchSender, DispatchReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchSender { tx }, DispatchReceiver { rx })
}

/// Producer handle; cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl DispatchSender {
    /// Enqueue an item. Never blocks.
    pub fn push(&self, item: impl Into<Inbound>) -> PolyResult<()> {
        self.tx
            .send(item.into())
            .map_err(|e| PolyError::State(format!("dispatch queue closed, dropped {}", e.0.kind())))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The consumer end. Exactly one exists per queue.
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl DispatchReceiver {
    /// Drain the queue on the current thread until every sender is dropped.
    ///
    /// Blocks while the queue is empty. Must not be called from inside an
    /// async context. Returns the number of items processed.
    pub fn run<F>(mut self, mut handler: F) -> usize
    where
        F: FnMut(Inbound) -> PolyResult<()>,
    {
        let mut processed = 0;
        while let Some(item) = self.rx.blocking_recv() {
            let kind = item.kind();
            debug!(kind, "Dispatching");
            match catch_unwind(AssertUnwindSafe(|| handler(item))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(kind, "Command failed: {}", e),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(kind, "Command handler panicked: {}", msg);
                }
            }
            processed += 1;
        }
        debug!(processed, "Dispatch queue closed");
        processed
    }

    /// Pop the next item without blocking.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }

    /// Run the consumer on its own named thread.
    pub fn spawn<F>(self, handler: F) -> std::io::Result<JoinHandle<usize>>
    where
        F: FnMut(Inbound) -> PolyResult<()> + Send + 'static,
    {
        std::thread::Builder::new()
            .name("polylink-dispatch".into())
            .spawn(move || self.run(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Control, Target};

    fn query(address: &str) -> Command {
        Command::Query(Target {
            address: address.to_string(),
        })
    }

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = dispatch_queue();
        for i in 0..50 {
            tx.push(query(&format!("n{}", i))).unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        let processed = rx.run(|item| {
            let Inbound::Dispatch(cmd) = item else {
                panic!("unexpected control item");
            };
            seen.push(cmd.address().unwrap().to_string());
            Ok(())
        });
        assert_eq!(processed, 50);
        let expected: Vec<String> = (0..50).map(|i| format!("n{}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_failures_do_not_stop_consumer() {
        let (tx, rx) = dispatch_queue();
        tx.push(Command::ShortPoll).unwrap();
        tx.push(Command::LongPoll).unwrap();
        tx.push(Command::Delete).unwrap();
        drop(tx);

        let mut handled = Vec::new();
        let processed = rx.run(|item| {
            handled.push(item.kind());
            match item {
                Inbound::Dispatch(Command::ShortPoll) => Err(PolyError::State("boom".into())),
                Inbound::Dispatch(Command::LongPoll) => panic!("handler bug"),
                _ => Ok(()),
            }
        });
        assert_eq!(processed, 3);
        assert_eq!(handled, vec!["shortPoll", "longPoll", "delete"]);
    }

    #[test]
    fn test_spawned_consumer_and_closed_queue() {
        let (tx, rx) = dispatch_queue();
        let handle = rx.spawn(|_| Ok(())).unwrap();
        tx.push(Command::ShortPoll).unwrap();
        let tx2 = tx.clone();
        drop(tx);
        tx2.push(Command::LongPoll).unwrap();
        drop(tx2);
        assert_eq!(handle.join().unwrap(), 2);

        let (tx, rx) = dispatch_queue();
        drop(rx);
        assert!(tx.is_closed());
        assert!(tx.push(Command::Delete).is_err());
    }

    #[test]
    fn test_control_items_keep_their_place() {
        let (tx, rx) = dispatch_queue();
        tx.push(query("before")).unwrap();
        tx.push(Inbound::Control(Control::Stop)).unwrap();
        tx.push(Command::LongPoll).unwrap();
        drop(tx);

        let mut kinds = Vec::new();
        rx.run(|item| {
            kinds.push(item.kind());
            Ok(())
        });
        assert_eq!(kinds, vec!["query", "stop", "longPoll"]);
    }
}
