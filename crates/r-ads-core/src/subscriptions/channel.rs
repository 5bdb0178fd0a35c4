//! ---
//! ads_section: "02-adapter-core"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Per-subscriber output channels honouring the overflow policy."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use r_ads_common::OverflowPolicy;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

/// Result of handing an item to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Dropped,
    Closed,
}

/// Result of reading from an output channel.
#[derive(Debug)]
pub(crate) enum Received<T> {
    Item(T),
    Lagged(u64),
    Closed,
}

/// Writer half. Never blocks the fan-out pump.
pub(crate) enum OutputSender<T> {
    Ring(broadcast::Sender<T>),
    Queue(mpsc::Sender<T>),
}

/// Reader half. The ring variant trims itself to `capacity`, since a broadcast
/// channel rounds its buffer up to a power of two.
pub(crate) enum OutputReceiver<T> {
    Ring {
        rx: broadcast::Receiver<T>,
        capacity: usize,
    },
    Queue(mpsc::Receiver<T>),
}

pub(crate) fn output_channel<T: Clone>(
    policy: OverflowPolicy,
    capacity: usize,
) -> (OutputSender<T>, OutputReceiver<T>) {
    let capacity = capacity.max(1);
    match policy {
        OverflowPolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (OutputSender::Ring(tx), OutputReceiver::Ring { rx, capacity })
        }
        OverflowPolicy::DropNewest => {
            let (tx, rx) = mpsc::channel(capacity);
            (OutputSender::Queue(tx), OutputReceiver::Queue(rx))
        }
    }
}

impl<T> OutputSender<T> {
    pub(crate) fn deliver(&self, item: T) -> Delivery {
        match self {
            // A full ring overwrites its oldest slot; the receiver learns about it as lag.
            OutputSender::Ring(tx) => match tx.send(item) {
                Ok(_) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            },
            OutputSender::Queue(tx) => match tx.try_send(item) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Dropped,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }
}

impl<T: Clone> OutputReceiver<T> {
    pub(crate) async fn recv(&mut self) -> Received<T> {
        match self {
            OutputReceiver::Ring { rx, capacity } => {
                let mut skipped = 0u64;
                while rx.len() > *capacity {
                    match rx.try_recv() {
                        Ok(_) => skipped += 1,
                        Err(broadcast::error::TryRecvError::Lagged(lost)) => skipped += lost,
                        Err(_) => break,
                    }
                }
                if skipped > 0 {
                    return Received::Lagged(skipped);
                }
                match rx.recv().await {
                    Ok(item) => Received::Item(item),
                    Err(broadcast::error::RecvError::Lagged(lost)) => Received::Lagged(lost),
                    Err(broadcast::error::RecvError::Closed) => Received::Closed,
                }
            }
            OutputReceiver::Queue(rx) => match rx.recv().await {
                Some(item) => Received::Item(item),
                None => Received::Closed,
            },
        }
    }
}
