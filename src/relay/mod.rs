pub mod lane;
pub mod node;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod swap;

pub use lane::{Lane, Window};
pub use node::{Relay, RelayReport, RelayState, StopReason};
pub use pool::{ConnectionPool, PoolSettings, ReleaseAction, RetirePolicy, SwapReport, release_action};
pub use retry::{CONNECTION_RETRIES, RetryBudget, RetryOutcome, run_with_retry};
pub use scheduler::RotationScheduler;
pub use shutdown::{ShutdownCoordinator, StoppedGuard};
pub use swap::SwapWorker;
