use std::hash::Hasher;

use twox_hash::XxHash64;

const EMPTY_HASH: u64 = 0;

pub fn content_hash(content: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(content);
    hasher.finish()
}

/// One-slot de-duplication filter over clipboard content.
///
/// Only the most recent hash is remembered, so `A, B, A` reports three
/// changes. Callers that share a detector between the send and receive
/// paths must serialize access themselves.
#[derive(Debug, Default, Clone)]
pub struct ChangeDetector {
    last_hash: u64,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_changed(&mut self, content: &[u8]) -> bool {
        let hash = content_hash(content);
        if hash == self.last_hash {
            return false;
        }
        self.last_hash = hash;
        true
    }

    pub fn reset(&mut self) {
        self.last_hash = EMPTY_HASH;
    }

    pub fn last_hash(&self) -> u64 {
        self.last_hash
    }
}
