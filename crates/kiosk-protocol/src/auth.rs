//! Pre-shared token authentication.

use std::{fmt, path::Path};

use sha2::{Digest, Sha256};

use crate::AuthError;

/// Lines longer than this many characters are authentication attempts.
pub const MAX_COMMAND_LEN: usize = 12;

/// Hex characters of the identifier digest used as the token.
const DERIVED_TOKEN_LEN: usize = 14;

/// The token a device must send before any command is accepted.
#[derive(Clone, PartialEq, Eq)]
pub struct ExpectedToken(String);

impl ExpectedToken {
    /// Wrap an explicit token.
    ///
    /// # Errors
    /// Returns error if the token would not be recognised as a token line.
    pub fn new(token: impl Into<String>) -> Result<Self, AuthError> {
        let token = token.into();
        let len = token.chars().count();
        if len <= MAX_COMMAND_LEN {
            return Err(AuthError::TokenTooShort { len });
        }
        Ok(Self(token))
    }

    /// Derive the token from a stable device identifier: the first 14 hex
    /// characters of its SHA-256 digest.
    ///
    /// # Errors
    /// Returns error if the identifier is blank.
    pub fn from_identifier(identifier: &str) -> Result<Self, AuthError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(AuthError::EmptyIdentifier);
        }
        let digest = hex::encode(Sha256::digest(identifier.as_bytes()));
        Ok(Self(digest[..DERIVED_TOKEN_LEN].to_string()))
    }

    /// Derive the token from an identifier file such as `/etc/machine-id`.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is blank.
    pub fn from_identifier_file(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_identifier(&contents)
    }

    /// Whether `candidate` is exactly this token.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate
    }

    /// The raw token, for the device emulator.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExpectedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExpectedToken").field(&"<redacted>").finish()
    }
}

/// Authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

/// Authentication session for the current link.
#[derive(Debug)]
pub struct AuthSession {
    expected: ExpectedToken,
    state: AuthState,
}

impl AuthSession {
    /// Create an unauthenticated session.
    #[must_use]
    pub const fn new(expected: ExpectedToken) -> Self {
        Self {
            expected,
            state: AuthState::Unauthenticated,
        }
    }

    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Whether `line` is long enough to be treated as a token.
    #[must_use]
    pub fn is_token_line(line: &str) -> bool {
        line.chars().count() > MAX_COMMAND_LEN
    }

    /// Present a token. A mismatch downgrades the session even if it was
    /// authenticated.
    ///
    /// # Errors
    /// Returns `AuthError::Mismatch` if the token is wrong.
    pub fn present(&mut self, token: &str) -> Result<(), AuthError> {
        if self.expected.matches(token) {
            self.state = AuthState::Authenticated;
            Ok(())
        } else {
            self.state = AuthState::Unauthenticated;
            Err(AuthError::Mismatch)
        }
    }

    /// Drop back to unauthenticated (new link).
    pub fn reset(&mut self) {
        self.state = AuthState::Unauthenticated;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use proptest::prelude::*;

    use super::*;

    const TOKEN: &str = "sometoken13chars+";

    #[test]
    fn test_short_token_rejected() {
        assert!(matches!(
            ExpectedToken::new("123456789012"),
            Err(AuthError::TokenTooShort { len: 12 })
        ));
        assert!(ExpectedToken::new("1234567890123").is_ok());
    }

    #[test]
    fn test_derived_token_shape() {
        let token = ExpectedToken::from_identifier("4c4c4544-0042\n").unwrap();
        assert_eq!(token.as_str().len(), 14);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(AuthSession::is_token_line(token.as_str()));

        let again = ExpectedToken::from_identifier("4c4c4544-0042").unwrap();
        assert_eq!(token, again);
    }

    #[test]
    fn test_derived_token_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0123456789abcdef").unwrap();

        let token = ExpectedToken::from_identifier_file(file.path()).unwrap();
        assert_eq!(
            token,
            ExpectedToken::from_identifier("0123456789abcdef").unwrap()
        );
    }

    #[test]
    fn test_blank_identifier_rejected() {
        assert!(matches!(
            ExpectedToken::from_identifier("  \n"),
            Err(AuthError::EmptyIdentifier)
        ));
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = ExpectedToken::new(TOKEN).unwrap();
        assert!(!format!("{token:?}").contains(TOKEN));
    }

    #[test]
    fn test_mismatch_downgrades() {
        let mut session = AuthSession::new(ExpectedToken::new(TOKEN).unwrap());
        session.present(TOKEN).unwrap();
        assert!(session.is_authenticated());

        assert!(session.present("not-the-right-token").is_err());
        assert_eq!(session.state(), AuthState::Unauthenticated);
    }

    proptest! {
        #[test]
        fn prop_long_tokens_decide_state(
            candidate in "[a-zA-Z0-9+]{13,40}",
            start_authenticated in any::<bool>(),
        ) {
            let mut session = AuthSession::new(ExpectedToken::new(TOKEN).unwrap());
            if start_authenticated {
                session.present(TOKEN).unwrap();
            }

            let result = session.present(&candidate);
            if candidate == TOKEN {
                prop_assert!(result.is_ok());
                prop_assert_eq!(session.state(), AuthState::Authenticated);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(session.state(), AuthState::Unauthenticated);
            }
        }
    }
}
