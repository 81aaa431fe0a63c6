//! Content hashing for the data and field hash tables.
//!
//! Files without the keyed-hash flag use Bob Jenkins' lookup3, combining
//! its two 32-bit results into one 64-bit value. Keyed files use
//! SipHash-2-4 keyed by the file id. Entry `xor_hash` values always use
//! lookup3 so they can be compared across files.

use crate::file::header::{IncompatibleFlag, JournalHeader};
use hashers::jenkins::Lookup3Hasher;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// 64-bit lookup3 hash with `pc` in the high half and `pb` in the low half.
pub fn jenkins_hash64(data: &[u8]) -> u64 {
    let mut hasher = Lookup3Hasher::default();
    hasher.write(data);
    let hash = hasher.finish();

    // finish() yields the two halves in the opposite order
    (hash << 32) | (hash >> 32)
}

pub fn siphash24(data: &[u8], key: &[u8; 16]) -> u64 {
    let key = u128::from_le_bytes(*key);
    let mut hasher = SipHasher24::new_with_keys(key as u64, (key >> 64) as u64);
    hasher.write(data);
    hasher.finish()
}

/// The hash function a particular file indexes its objects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Jenkins,
    Keyed([u8; 16]),
}

impl HashAlgorithm {
    pub fn for_header(header: &JournalHeader) -> Self {
        if header.has_incompatible_flag(IncompatibleFlag::KeyedHash) {
            HashAlgorithm::Keyed(header.file_id)
        } else {
            HashAlgorithm::Jenkins
        }
    }

    pub fn hash(&self, data: &[u8]) -> u64 {
        match self {
            HashAlgorithm::Jenkins => jenkins_hash64(data),
            HashAlgorithm::Keyed(file_id) => siphash24(data, file_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_a_constant() {
        assert_eq!(jenkins_hash64(b""), 0xdeadbeefdeadbeef);
    }

    #[test]
    fn known_values() {
        assert_eq!(jenkins_hash64(b"MESSAGE=hello"), 0x87ddeff2fd1bd06d);
        assert_eq!(
            jenkins_hash64(b"hash value ... hash value ... "),
            0x34436c8269eb4c47
        );
    }

    #[test]
    fn halves_are_swapped_from_the_hasher() {
        for input in [
            &b"a"[..],
            b"MESSAGE",
            b"_TRANSPORT=journal",
            b"exactly twelve",
            b"a much longer field value spanning several lookup3 blocks",
        ] {
            let mut hasher = Lookup3Hasher::default();
            hasher.write(input);
            let h = hasher.finish();
            assert_eq!(jenkins_hash64(input) >> 32, h & 0xffff_ffff, "input {:?}", input);
            assert_eq!(jenkins_hash64(input) & 0xffff_ffff, h >> 32, "input {:?}", input);
        }
    }

    #[test]
    fn keyed_hash_depends_on_file_id() {
        let a = HashAlgorithm::Keyed([1; 16]);
        let b = HashAlgorithm::Keyed([2; 16]);
        assert_ne!(a.hash(b"MESSAGE=hello"), b.hash(b"MESSAGE=hello"));
        assert_eq!(
            HashAlgorithm::Jenkins.hash(b"MESSAGE=hello"),
            jenkins_hash64(b"MESSAGE=hello")
        );
    }
}
