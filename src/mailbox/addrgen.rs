// SPDX-License-Identifier: MIT
// Disposable address generation with a store-backed uniqueness oracle.

use rand::Rng;

use crate::config::AddressConfig;
use crate::error::{EngineError, Result};
use crate::mailbox::store::MailboxStore;

/// Produces collision-free `{prefix}_{suffix}@{domain}` addresses.
///
/// Uniqueness is checked against the full mailbox history (retired rows
/// included) so a recycled prefix can never leak another owner's late mail
/// inside the retention window.
pub struct AddressGenerator {
    config: AddressConfig,
}

impl AddressGenerator {
    pub fn new(config: AddressConfig) -> Self {
        Self { config }
    }

    /// Generate a unique address, retrying the random suffix on collision up
    /// to the configured attempt cap.
    pub async fn generate(
        &self,
        store: &MailboxStore,
        requested_prefix: Option<&str>,
    ) -> Result<String> {
        let prefix = self.sanitize_prefix(requested_prefix)?;

        for attempt in 0..self.config.max_attempts {
            let suffix = self.random_string(self.config.suffix_len);
            let address = format!("{}_{}@{}", prefix, suffix, self.config.domain);

            if !store.address_exists(&address).await? {
                return Ok(address);
            }
            tracing::debug!(address = %address, attempt, "address collision, retrying");
        }

        Err(EngineError::AddressExhaustion {
            attempts: self.config.max_attempts,
        })
    }

    /// Sanitize a caller-supplied prefix, or draw a random one.
    ///
    /// Sanitation: lowercase, keep `[a-z0-9]` only, truncate to the fixed
    /// prefix length, pad with random allowed characters when short. Input
    /// shorter than the configured minimum is rejected outright rather than
    /// silently padded into something unrecognizable.
    pub fn sanitize_prefix(&self, requested: Option<&str>) -> Result<String> {
        let requested = match requested {
            Some(r) => r,
            None => return Ok(self.random_string(self.config.prefix_len)),
        };

        if requested.chars().count() < self.config.min_requested_len {
            return Err(EngineError::InvalidPrefix(format!(
                "prefix must be at least {} characters",
                self.config.min_requested_len
            )));
        }

        let mut clean: String = requested
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(self.config.prefix_len)
            .collect();

        if clean.is_empty() {
            return Err(EngineError::InvalidPrefix(
                "prefix must contain letters or digits".to_string(),
            ));
        }
        while clean.chars().count() < self.config.prefix_len {
            clean.push(self.random_char());
        }
        Ok(clean)
    }

    fn random_char(&self) -> char {
        let alphabet: Vec<char> = self.config.alphabet.chars().collect();
        let idx = rand::thread_rng().gen_range(0..alphabet.len());
        alphabet[idx]
    }

    fn random_string(&self, len: usize) -> String {
        (0..len).map(|_| self.random_char()).collect()
    }
}
