//! Acknowledgment tracking and consumer flow control.
//!
//! Both structures are owned by exactly one channel session and are only
//! touched under that session's lock.
//!
//! # Delivery Lifecycle
//!
//! ```text
//!   deliver ──► tracked (tag N) ──┬── ack ─────────────► settled
//!                                 ├── reject(requeue) ──► back on queue, redelivered
//!                                 ├── reject(drop) ─────► discarded / returned
//!                                 └── channel close ────► release_all
//! ```
//!
//! Every exit from the tracked set returns the consumer's credit.
//!
//! | Window      | Limit field          | Zero means |
//! |-------------|----------------------|------------|
//! | Count       | `CreditLimit::count` | unlimited  |
//! | Bytes       | `CreditLimit::bytes` | unlimited  |

mod flow;
mod tracker;

pub use flow::{ConsumerFlowController, ConsumerId, ConsumerState, CreditLimit, CreditOutcome};
pub use tracker::{DeliveryTracker, ReleaseSummary, TrackedDelivery};
