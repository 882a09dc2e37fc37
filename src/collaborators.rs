//! Interfaces to services owned outside this crate.

/// User preferences consumed by the access policy.
pub trait PreferencesStore: Send + Sync {
    fn allow_nsfw(&self) -> bool;
}

impl<F> PreferencesStore for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn allow_nsfw(&self) -> bool {
        self()
    }
}
