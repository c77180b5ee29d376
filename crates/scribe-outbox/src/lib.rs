//! Transactional outbox for the Scribe platform.
//!
//! A state-changing write records its domain event in the `outbox_events`
//! table inside the *same* transaction as the business mutation, so the
//! event exists if and only if the mutation committed. A relay later claims
//! pending rows, publishes them, and marks them sent or failed.
//!
//! # Row lifecycle
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `NEW`  | Waiting for the relay. May carry a short lease (`claimed_by`, `claimed_until`) while a worker publishes it. |
//! | `SENT` | Acknowledged by the bus. Terminal; kept for audit and replay. |
//! | `DEAD` | Attempt cap reached. Terminal until an operator requeues it. |
//!
//! # Claiming
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`, so a claim is a lease
//! stamped onto the rows in one `IMMEDIATE` transaction. Rows leased by a
//! live worker are skipped by other workers; a crashed worker's rows become
//! claimable again once the lease expires. A claim never takes a row while
//! an earlier row of the same aggregate is leased elsewhere.
//!
//! The relay renews the lease on each row right before publishing it and
//! skips the row if the renewal fails, so a slow batch cannot publish a row
//! another worker has since taken over. The lease must outlive one publish
//! call. A crash between publish and mark-sent still republishes the row
//! after expiry: delivery is at-least-once.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scribe_outbox::{create_within_transaction, InsertOutcome};
//!
//! let tx = conn.transaction()?;
//! insert_post(&tx, &post)?;
//! create_within_transaction(&tx, "blog.events", &envelope)?;
//! tx.commit()?;
//! ```

mod error;
mod record;
mod store;

pub use error::OutboxError;
pub use record::{InsertOutcome, OutboxRecord};
pub use store::{
    count_by_status, create_within_transaction, fetch_batch_for_publish, get_by_event_id,
    get_record, list_dead, mark_failed, mark_sent, purge_sent_before, release_claim,
    renew_lease, requeue_dead, ClaimRequest,
};
