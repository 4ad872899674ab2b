//! Shared state and messaging
//!
//! Events flowing into the pipeline controller and the runtime status it
//! publishes for other threads.

pub mod messages;
pub mod state;

pub use messages::PipelineEvent;
pub use state::{RuntimeState, SharedRuntime};
