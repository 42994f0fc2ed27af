//! Pre-shared auth tokens.
//!
//! The token is an opaque credential handed to the daemon through a file
//! that the controlling process deletes as soon as the port announcement
//! is read. It must therefore be loaded before the listen socket is
//! created.

use crate::error::{ReplayError, Result};
use std::fs;
use std::path::Path;

/// An opaque pre-shared credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken(Vec<u8>);

impl AuthToken {
    /// Load a token from a file. A single trailing newline is trimmed so
    /// tokens written by shell tooling compare equal.
    ///
    /// Failure to read a configured token file is fatal to startup.
    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = fs::read(path).map_err(|e| ReplayError::AuthTokenFile {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Ok(Self(bytes))
    }

    /// Build a token from raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Compare against a presented credential.
    pub fn matches(&self, presented: &[u8]) -> bool {
        self.0 == presented
    }

    /// The raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_trims_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"s3cret\n").unwrap();
        let token = AuthToken::load(file.path()).unwrap();
        assert!(token.matches(b"s3cret"));
        assert!(!token.matches(b"s3cret\n"));
        assert!(!token.matches(b"wrong"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = AuthToken::load(Path::new("/no/such/token")).unwrap_err();
        assert!(matches!(err, ReplayError::AuthTokenFile { .. }));
    }
}
