pub mod consumer;
pub mod longrun;
pub mod oneshot;
pub mod storage;
pub mod wire;

pub use consumer::{run_forever, QueueConsumer, QueueRuntime};
