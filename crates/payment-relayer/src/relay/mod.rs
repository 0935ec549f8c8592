// Delivery pipeline: classification, retry policy, dispatch loops and the engine

pub mod classify;
pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod retry;

pub use classify::{
    classify, classify_node_message, classify_transport_message, FailureClass, TransientKind,
};
pub use delivery::{Deliverer, RelayOutcome};
pub use dispatcher::{ChainDispatcher, Lane, TickOutcome};
pub use engine::RelayEngine;
pub use retry::{RetryDecision, RetryPolicy};
