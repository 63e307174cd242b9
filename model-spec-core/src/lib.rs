//! Shared model/provider spec types used by the Model Config Registry (C7)
//! and by provider adapters.
//!
//! Kept as its own crate (rather than folded into `story-engine`) because the
//! config layer (`config` crate) also needs [`ModelPreference`] to validate
//! per-agent override tables without depending on the whole engine crate.

mod preference;
mod spec;

pub use preference::ModelPreference;
pub use spec::ModelSpec;
