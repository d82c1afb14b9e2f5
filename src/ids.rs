//! Random identifiers for frames, runners and object uids.
//!
//! Identifiers use lowercase letters and digits only so they are valid inside
//! backend object names and labels.

use rand::Rng;
use std::collections::HashSet;

/// Length of generated frame and runner identifiers.
pub const ID_LENGTH: usize = 10;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A random identifier of [`ID_LENGTH`] characters.
pub fn random_id() -> String {
    random_string(ID_LENGTH)
}

/// A random lowercase alphanumeric string of `len` characters.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// `count` distinct identifiers, none of which appears in `taken`.
pub fn random_ids(count: usize, taken: &HashSet<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(count);
    let mut ids = Vec::with_capacity(count);
    while ids.len() < count {
        let id = random_id();
        if taken.contains(&id) || !seen.insert(id.clone()) {
            continue;
        }
        ids.push(id);
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id_shape() {
        let id = random_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(
            id.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn test_random_ids_are_unique_and_avoid_taken() {
        let taken: HashSet<String> = (0..50).map(|_| random_id()).collect();
        let ids = random_ids(200, &taken);
        assert_eq!(ids.len(), 200);
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 200);
        assert!(ids.iter().all(|id| !taken.contains(id)));
    }
}
