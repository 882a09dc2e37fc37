//! Content access policy evaluated before every send.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborators::PreferencesStore;

/// Flags the policy decides over. Everything defaults to the most
/// restrictive value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags {
    pub consent_loaded: bool,
    pub consent_required: bool,
    pub consent_granted: bool,
    pub age_verified: bool,
    pub allow_nsfw: bool,
}

impl AccessFlags {
    /// Consent loaded and granted, age verified, nsfw allowed.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            consent_loaded: true,
            consent_required: true,
            consent_granted: true,
            age_verified: true,
            allow_nsfw: true,
        }
    }

    /// Takes `allow_nsfw` from the user's stored preference.
    #[must_use]
    pub fn with_preferences(mut self, preferences: &dyn PreferencesStore) -> Self {
        self.allow_nsfw = preferences.allow_nsfw();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    ConsentPending,
    ConsentRequired,
    AgeRequired,
    NsfwDisabled,
    /// Set by an external tag filter; [`ContentAccessGate`] never yields it.
    TagsBlocked,
}

impl BlockReason {
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConsentPending => "CONSENT_PENDING",
            Self::ConsentRequired => "CONSENT_REQUIRED",
            Self::AgeRequired => "AGE_REQUIRED",
            Self::NsfwDisabled => "NSFW_DISABLED",
            Self::TagsBlocked => "TAGS_BLOCKED",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Blocked(BlockReason),
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentAccessGate {
    flags: AccessFlags,
}

impl ContentAccessGate {
    pub fn new(flags: AccessFlags) -> Self {
        Self { flags }
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    /// First failing check wins: consent loaded, consent granted when
    /// required, age verified, nsfw allowed for nsfw content.
    pub fn decide(&self, is_nsfw: bool) -> AccessDecision {
        let flags = self.flags;
        if !flags.consent_loaded {
            return AccessDecision::Blocked(BlockReason::ConsentPending);
        }
        if flags.consent_required && !flags.consent_granted {
            return AccessDecision::Blocked(BlockReason::ConsentRequired);
        }
        if !flags.age_verified {
            return AccessDecision::Blocked(BlockReason::AgeRequired);
        }
        if is_nsfw && !flags.allow_nsfw {
            return AccessDecision::Blocked(BlockReason::NsfwDisabled);
        }
        AccessDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_block_on_pending_consent() {
        let gate = ContentAccessGate::default();
        assert_eq!(
            gate.decide(false),
            AccessDecision::Blocked(BlockReason::ConsentPending)
        );
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(BlockReason::NsfwDisabled.to_string(), "NSFW_DISABLED");
        assert_eq!(
            serde_json::to_string(&BlockReason::ConsentRequired).expect("serialize"),
            "\"CONSENT_REQUIRED\""
        );
    }
}
