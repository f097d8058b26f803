//! Tollgate - keyed token-bucket admission control
//!
//! Every key owns an independent bucket that refills continuously at a fixed
//! rate up to its capacity. Requests are admitted by debiting their cost from
//! the key's bucket and rejected when not enough tokens remain.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;
