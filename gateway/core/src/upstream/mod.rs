//! Upstream Calls
//!
//! [`UpstreamCaller`] runs requests against the provider under an explicit
//! [`RetryPolicy`]; [`call_with_policy`] is the generic retry loop it uses.

mod caller;
mod retry;

pub use caller::{UpstreamCaller, UpstreamReply};
pub use retry::{call_with_policy, RetryPolicy};
