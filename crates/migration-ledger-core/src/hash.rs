use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{ContentHash, LedgerError};

/// Computes the digest recorded for a script file.
pub trait ContentHasher {
    /// Hashes the full contents of the file at `path`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the file cannot be read.
    fn hash_file(&self, path: &Path) -> Result<ContentHash, LedgerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash_file(&self, path: &Path) -> Result<ContentHash, LedgerError> {
        let io_error = |err: io::Error| LedgerError::Io {
            path: path.to_path_buf(),
            detail: err.to_string(),
        };

        let mut file = File::open(path).map_err(io_error)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher).map_err(io_error)?;

        Ok(ContentHash(hex::encode(hasher.finalize())))
    }
}

#[cfg(test)]
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
