//! SHA-256 hex digests for artifact verification.

use sha2::{Digest, Sha256};

/// Incremental digest for data that arrives in chunks.
#[derive(Default)]
pub struct StreamingSha256 {
    inner: Sha256,
}

impl StreamingSha256 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish_hex(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}

/// Case-insensitive comparison of two hex digests.
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}
