//! Per-block-number admission control.
//!
//! Only one worker may process a given block number at a time; duplicates
//! waste node bandwidth and can collide in the store. Surplus contenders are
//! not serialized either — on release, the first waiter gets the go-ahead
//! and every later waiter gets a no-go and is expected to defer the number
//! to the retry queue, where it is throttled and deduplicated.
//!
//! The `number → waiter FIFO` map is owned by a single task that receives
//! acquire/release messages, so the go/no-go hand-off has no races around
//! the queue head.

use std::collections::{hash_map::Entry, HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifies one acquisition slot; the holder passes it back on release.
pub type Ticket = u64;

/// Result of an acquire call.
pub enum Acquisition {
    /// The caller is now the holder.
    Immediate(Ticket),
    /// Someone else holds the number. The receiver yields the verdict when
    /// the holder finishes: `true` = the caller is now the holder, `false` =
    /// no-go, defer to the retry queue.
    Queued(Ticket, oneshot::Receiver<bool>),
}

enum LockCommand {
    Acquire {
        number: u64,
        resp: oneshot::Sender<Acquisition>,
    },
    Release {
        number: u64,
        ticket: Ticket,
    },
    IsHeld {
        number: u64,
        resp: oneshot::Sender<bool>,
    },
}

struct Slot {
    holder: Ticket,
    waiters: VecDeque<(Ticket, oneshot::Sender<bool>)>,
}

/// Handle to the lock task. Cheap to clone.
#[derive(Clone)]
pub struct ProcessQueueLock {
    tx: mpsc::UnboundedSender<LockCommand>,
}

impl ProcessQueueLock {
    /// Spawn the owning task and return a handle to it.
    pub fn start(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, cancel));
        Self { tx }
    }

    /// Try to become the holder for `number`.
    ///
    /// Returns `None` only when the lock task has shut down.
    pub async fn acquire(&self, number: u64) -> Option<Acquisition> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(LockCommand::Acquire {
                number,
                resp: resp_tx,
            })
            .ok()?;
        resp_rx.await.ok()
    }

    /// Release the number. Must be called with the ticket obtained from
    /// [`ProcessQueueLock::acquire`] (directly or via a `true` verdict).
    pub fn release(&self, number: u64, ticket: Ticket) {
        let _ = self.tx.send(LockCommand::Release { number, ticket });
    }

    /// Returns `true` if some worker currently holds `number`. Used by the
    /// retry manager to deduplicate queue entries against in-flight work.
    pub async fn is_held(&self, number: u64) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .tx
            .send(LockCommand::IsHeld {
                number,
                resp: resp_tx,
            })
            .is_err()
        {
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<LockCommand>, cancel: CancellationToken) {
    let mut slots: HashMap<u64, Slot> = HashMap::new();
    let mut next_ticket: Ticket = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // Flush every waiter with a no-go so nothing hangs on shutdown.
                for (_, slot) in slots.drain() {
                    for (_, verdict) in slot.waiters {
                        let _ = verdict.send(false);
                    }
                }
                debug!("lock task shut down");
                return;
            }

            cmd = rx.recv() => {
                let Some(cmd) = cmd else { return };
                match cmd {
                    LockCommand::Acquire { number, resp } => {
                        next_ticket += 1;
                        let ticket = next_ticket;
                        match slots.entry(number) {
                            Entry::Vacant(vacant) => {
                                vacant.insert(Slot {
                                    holder: ticket,
                                    waiters: VecDeque::new(),
                                });
                                let _ = resp.send(Acquisition::Immediate(ticket));
                            }
                            Entry::Occupied(mut occupied) => {
                                let (verdict_tx, verdict_rx) = oneshot::channel();
                                occupied.get_mut().waiters.push_back((ticket, verdict_tx));
                                let _ = resp.send(Acquisition::Queued(ticket, verdict_rx));
                            }
                        }
                    }

                    LockCommand::Release { number, ticket } => {
                        match slots.get_mut(&number) {
                            Some(slot) if slot.holder == ticket => {
                                // Promote the first live waiter; everyone
                                // behind it gets a no-go.
                                let mut promoted = false;
                                while let Some((next, verdict)) = slot.waiters.pop_front() {
                                    if verdict.send(true).is_ok() {
                                        slot.holder = next;
                                        promoted = true;
                                        break;
                                    }
                                    // Waiter went away while queued; skip it.
                                }
                                if promoted {
                                    for (_, verdict) in slot.waiters.drain(..) {
                                        let _ = verdict.send(false);
                                    }
                                } else {
                                    slots.remove(&number);
                                }
                            }
                            _ => {
                                warn!(number, ticket, "release for a lock not held by this ticket");
                            }
                        }
                    }

                    LockCommand::IsHeld { number, resp } => {
                        let _ = resp.send(slots.contains_key(&number));
                    }
                }
            }
        }
    }
}
