pub(crate) mod builder;
pub(crate) mod shutdown;

pub use builder::{DbrbNode, DbrbStarter, StartError};
pub use shutdown::{Shutdown, ShutdownHandle, ShutdownManager};
