//! fleet-provider — the seams between the control plane and the outside world.
//!
//! The orchestration logic only ever talks to a compute provider, an
//! object store, a queue service, and a token issuer through the traits
//! defined here. Concrete cloud adapters live outside this workspace;
//! [`memory`] provides in-process implementations that record every
//! mutating call.
//!
//! [`converge`] holds the shared fast-then-slow polling loop and the
//! jittered retry used for throttled provider calls.

pub mod compute;
pub mod converge;
pub mod error;
pub mod memory;
pub mod queue;
pub mod storage;
pub mod token;

pub use compute::*;
pub use converge::{Poll, PollPolicy, RetryPolicy, retry_throttled, wait_until};
pub use error::{ErrorKind, ProviderError, ProviderResult};
pub use queue::*;
pub use storage::ObjectStore;
pub use token::{TokenIssuer, TokenScope};
