//! Room code generation.
//!
//! A code is the literal prefix [`CODE_PREFIX`] followed by
//! [`CODE_RANDOM_LEN`] symbols drawn uniformly, with replacement, from
//! [`ALPHABET`]. Codes are not checked for uniqueness: the keyspace is
//! 52^42, so two open rooms sharing a code is not a case the relay handles.

use rand::Rng;

/// Fixed prefix of every room code.
pub const CODE_PREFIX: &str = "CLaJ";

/// Number of random symbols after the prefix.
pub const CODE_RANDOM_LEN: usize = 42;

/// Total length of a room code.
pub const CODE_LEN: usize = CODE_PREFIX.len() + CODE_RANDOM_LEN;

/// Symbols allowed in the random part of a code.
pub const ALPHABET: &[u8; 52] = b"AaBbCcDdEeFfGgHhIiJjKkLlMmNnOoPpQqRrSsTtUuVvWwYyXxZz";

/// Generate a room code using the thread-local RNG.
///
/// # Examples
///
/// ```
/// use claj_common::code::{generate_code, is_well_formed_code, CODE_LEN};
/// let code = generate_code();
/// assert_eq!(code.len(), CODE_LEN);
/// assert!(is_well_formed_code(&code));
/// ```
#[must_use]
pub fn generate_code() -> String {
    generate_code_with(&mut rand::thread_rng())
}

/// Generate a room code from the given RNG.
#[must_use]
pub fn generate_code_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut code = String::with_capacity(CODE_LEN);
    code.push_str(CODE_PREFIX);
    for _ in 0..CODE_RANDOM_LEN {
        code.push(char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]));
    }
    code
}

/// Returns `true` if `s` has the shape of a generated room code.
#[must_use]
pub fn is_well_formed_code(s: &str) -> bool {
    s.len() == CODE_LEN
        && s.starts_with(CODE_PREFIX)
        && s.as_bytes()[CODE_PREFIX.len()..]
            .iter()
            .all(|b| ALPHABET.contains(b))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    proptest! {
        #[test]
        fn every_generated_code_is_well_formed(seed in any::<u64>()) {
            let code = generate_code_with(&mut StdRng::seed_from_u64(seed));
            prop_assert_eq!(code.len(), CODE_LEN);
            prop_assert!(is_well_formed_code(&code));
        }
    }
}
