//! Short public identifiers for new entries.
//!
//! Identifiers double as blob filenames and URL path segments, so the
//! alphabet is restricted to ASCII letters and digits.

use rand::distributions::Alphanumeric;
use rand::Rng;

pub const ID_LEN: usize = 8;

/// Upper bound on fresh identifiers tried for a single upload.
pub const MAX_ID_ATTEMPTS: usize = 8;

pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// 8 random alphanumerics: 62^8 ≈ 2.2e14 possibilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_LEN)
            .map(char::from)
            .collect()
    }
}

/// Whether `id` could have come from a generator. Anything else is rejected
/// before it gets near the filesystem.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric())
}
