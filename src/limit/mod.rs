//! Rate-limit primitives.
//!
//! Named token buckets for gateway send/identify discipline, and the
//! process-wide ticket pool that bounds concurrent dispatches.

mod bucket;
mod ticket;

pub use bucket::BucketStore;
pub use ticket::{Ticket, TicketPool};
