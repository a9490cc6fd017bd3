//! 核心基础设施：错误类型、子进程组管理、优雅关闭

pub mod error;
pub mod process;
pub mod shutdown;

pub use error::{ChannelError, HiveError, SideEffectError, StoreError};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
