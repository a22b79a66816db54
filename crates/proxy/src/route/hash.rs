use std::hash::Hasher;

use codec::Metadata;
use rustc_hash::FxHasher;

/// Derives a load-balancer hash key from request headers.
///
/// Values are sorted before hashing so the key does not depend on the order
/// the headers are listed in. Absent headers count as empty strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashPolicy {
    headers: Vec<String>,
}

impl HashPolicy {
    /// Creates a policy over `headers`.
    #[must_use]
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers }
    }

    /// Returns `None` when the policy names no header.
    #[must_use]
    pub fn generate_hash(&self, metadata: &Metadata) -> Option<u64> {
        if self.headers.is_empty() {
            return None;
        }
        let mut values: Vec<&str> = self
            .headers
            .iter()
            .map(|name| metadata.get_string(name).unwrap_or_default())
            .collect();
        values.sort_unstable();

        let mut hasher = FxHasher::default();
        for value in values {
            hasher.write(value.as_bytes());
            hasher.write_u8(0xff);
        }
        Some(hasher.finish())
    }
}
