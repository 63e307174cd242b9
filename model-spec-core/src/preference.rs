//! `ModelPreference`: an opaque `provider/model` identifier.
//! Consumed only by provider adapters and by the Model Config Registry (C7);
//! no provider-specific shape leaks past this type.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelPreference {
    pub provider: String,
    pub model: String,
}

impl ModelPreference {
    /// Parses `"provider/model"`. A string with no `/` is treated as a bare
    /// model name under an empty provider, callers that need a provider
    /// fall back to their own default adapter in that case.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Self {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            _ => Self {
                provider: String::new(),
                model: raw.to_string(),
            },
        }
    }

    pub fn has_provider(&self) -> bool {
        !self.provider.is_empty()
    }
}

impl fmt::Display for ModelPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_provider() {
            write!(f, "{}/{}", self.provider, self.model)
        } else {
            write!(f, "{}", self.model)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_and_model() {
        let pref = ModelPreference::parse("openai/gpt-4o-mini");
        assert_eq!(pref.provider, "openai");
        assert_eq!(pref.model, "gpt-4o-mini");
    }

    #[test]
    fn bare_model_name_has_no_provider() {
        let pref = ModelPreference::parse("gpt-4o-mini");
        assert!(!pref.has_provider());
        assert_eq!(pref.model, "gpt-4o-mini");
    }

    #[test]
    fn display_round_trips_provider_slash_model() {
        let pref = ModelPreference::parse("anthropic/claude-3-5-sonnet");
        assert_eq!(pref.to_string(), "anthropic/claude-3-5-sonnet");
    }
}
