pub mod basic;
pub mod community;
pub mod maintainer;
pub mod scheduler;

pub use maintainer::{Maintainer, MaintainerCtx, MaintainerError, build_maintainer};
pub use scheduler::{Supervisor, SupervisorError};
