//! Counting semaphore handing out numbered tickets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds concurrent work across the process. `wait` suspends until a
/// slot frees and returns a ticket whose id is attached to event traces.
/// Dropping the ticket frees the slot; freeing twice is impossible by
/// construction.
#[derive(Debug, Clone)]
pub struct TicketPool {
    semaphore: Arc<Semaphore>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

#[derive(Debug)]
pub struct Ticket {
    id: u64,
    _permit: OwnedSemaphorePermit,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl TicketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn wait(&self) -> Ticket {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("ticket pool semaphore closed");
        Ticket {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            _permit: permit,
        }
    }
}
