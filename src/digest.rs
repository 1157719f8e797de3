//! The identifier digest used throughout the crate.
//!
//! Every identifier is the lowercase hex encoding of a 128-bit MD5 digest.
//! Merkle identifiers hash a *sorted* list of strings, which makes them
//! independent of the order successors were discovered in.

use md5::{Digest, Md5};

/// Digest a list of strings by feeding them to the hasher in order.
///
/// Callers are responsible for sorting the list first when order must not
/// matter (see [`digest_sorted`]).
pub fn digest_list<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Sort the list lexicographically, then digest it.
pub fn digest_sorted<S: AsRef<str> + Ord>(parts: &mut Vec<S>) -> String {
    parts.sort();
    digest_list(parts)
}

/// Digest raw bytes. Used for payload identifiers.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_digest_is_concatenation() {
        // md5("abc")
        assert_eq!(
            digest_list(&["a", "b", "c"]),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(digest_list(&["abc"]), digest_list(&["ab", "c"]));
    }

    #[test]
    fn sorted_digest_ignores_order() {
        let mut a = vec!["x", "a", "m"];
        let mut b = vec!["m", "x", "a"];
        assert_eq!(digest_sorted(&mut a), digest_sorted(&mut b));
    }

    #[test]
    fn empty_list() {
        // md5("")
        assert_eq!(digest_list::<&str>(&[]), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
