#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use policy_cache_core as core;
pub use policy_cache_index as index;

mod args;
mod churn;
pub mod synthetic;

pub use self::args::Args;
