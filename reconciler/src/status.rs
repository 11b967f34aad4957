use wireguard_control::Key;

use crate::dataplane::StatusCallback;

/// Publishes the locally-advertised public key upward exactly on change
/// (C7). The last-published key only advances on a successful callback, so
/// a failing callback retries on the next Apply (spec.md §4.6, property 6).
#[derive(Default)]
pub struct StatusPublisher {
    last_published: Option<Key>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `key` if it differs from the last successfully published
    /// value (including the very first publication). Returns the callback's
    /// error, if any, without advancing `last_published`.
    pub fn publish(
        &mut self,
        key: Key,
        callback: &mut dyn StatusCallback,
    ) -> Result<(), String> {
        if self.last_published.as_ref() == Some(&key) {
            return Ok(());
        }
        callback.status(key.clone())?;
        self.last_published = Some(key);
        Ok(())
    }
}
