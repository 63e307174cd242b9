//! Model specification: context limit, output limit, and optional cache limits.
//!
//! Lives in its own crate so both `config` and `story-engine` can see it
//! without the `story-engine -> config` dependency edge running backwards.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub context_limit: u32,
    pub output_limit: u32,
    #[serde(default)]
    pub cache_read: Option<u32>,
    #[serde(default)]
    pub cache_write: Option<u32>,
}

impl ModelSpec {
    pub fn new(context_limit: u32, output_limit: u32) -> Self {
        Self {
            context_limit,
            output_limit,
            cache_read: None,
            cache_write: None,
        }
    }
}
