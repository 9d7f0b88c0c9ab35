pub mod events;
pub(crate) mod exec;
pub mod processor;
pub mod queue;
pub mod types;


pub use events::*;
pub use processor::*;
pub use queue::*;
pub use types::*;
