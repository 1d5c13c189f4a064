//! Shared ambient stack for the proxybroker workspace: the duration
//! (de)serialization helpers and logging bootstrap that every other crate
//! builds on.

pub mod duration;
pub mod logging;

/// Cheaply-cloned immutable string used for identifiers that get copied
/// across tasks a lot: hostnames, country codes, judge names, negotiator
/// names. `ArcStr` is reference-counted, so cloning is an atomic increment
/// rather than a heap allocation.
pub type Strng = arcstr::ArcStr;
