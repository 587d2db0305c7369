pub mod endpoint;
pub mod event;
pub mod probe;
pub mod snapshot;

pub use endpoint::*;
pub use event::*;
pub use probe::*;
pub use snapshot::*;
