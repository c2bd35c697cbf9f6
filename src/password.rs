//! Passphrase capability for private-key encryption at rest: an object
//! with a `derive` method plus a cached last-used cipher, rather than a
//! password-prompt callback threaded through FFI or hidden global state.

/// A passphrase bound to the label it was derived for (e.g.
/// `"acme_client"`), so a provider never hands back the wrong key's
/// passphrase just because one happens to be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCipher {
    pub label: String,
    pub passphrase: String,
}

/// Supplies passphrases for key (de)serialization, memoizing the most
/// recently derived cipher so repeated calls for the same label during
/// one bootstrap don't reprompt or redo derivation work.
pub struct PasswordProvider {
    configured: Option<String>,
    last: Option<KeyCipher>,
}

impl PasswordProvider {
    pub fn new(configured_passphrase: Option<String>) -> Self {
        PasswordProvider {
            configured: configured_passphrase,
            last: None,
        }
    }

    /// Return the cipher for `label`. Returns `None` only when no
    /// passphrase is configured (clear-text policy); `create_if_missing`
    /// solely controls whether the result gets cached for later calls,
    /// not whether a configured passphrase is reported at all.
    pub fn derive(&mut self, label: &str, create_if_missing: bool) -> Option<KeyCipher> {
        if let Some(cipher) = &self.last {
            if cipher.label == label {
                return Some(cipher.clone());
            }
        }
        let passphrase = self.configured.clone()?;
        let cipher = KeyCipher {
            label: label.to_string(),
            passphrase,
        };
        if create_if_missing {
            self.last = Some(cipher.clone());
        }
        Some(cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_memoizes_for_same_label() {
        let mut provider = PasswordProvider::new(Some("hunter2".to_string()));
        let a = provider.derive("acme_client", true).unwrap();
        let b = provider.derive("acme_client", true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn derive_without_configured_passphrase_is_none() {
        let mut provider = PasswordProvider::new(None);
        assert!(provider.derive("acme_client", true).is_none());
    }

    #[test]
    fn derive_without_create_if_missing_still_returns_configured_passphrase() {
        let mut provider = PasswordProvider::new(Some("hunter2".to_string()));
        assert!(provider.derive("acme_client", false).is_some());
    }
}
