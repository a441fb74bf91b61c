//! Transaction pipeline: nonce allocation, grouping and submission

mod group;
mod nonce;
mod sender;

pub use group::{
    build_batch, build_group, BracketSpec, GroupedOrderSpec, GroupingMode, TransactionBatch,
    TriggerLeg,
};
pub use nonce::{NonceAllocator, NonceKey};
pub use sender::{Submission, TransactionSubmitter};
