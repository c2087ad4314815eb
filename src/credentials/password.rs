//! Password generation

use rand::Rng;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

/// Special characters that survive connection strings and naive client parsers
pub const SPECIAL_CHARACTERS: &[u8] = b"+-_.:<>?";

/// Password generation policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub length: usize,
    pub special_characters: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: 16,
            special_characters: true,
        }
    }
}

impl PasswordPolicy {
    /// Shortest length that can hold one character of every required class
    pub fn minimum_length(&self) -> usize {
        if self.special_characters {
            4
        } else {
            3
        }
    }

    /// Generate a password satisfying the policy.
    ///
    /// The first character is always alphanumeric. Candidates missing any
    /// required character class are discarded.
    pub fn generate(&self) -> String {
        let length = self.length.max(self.minimum_length());
        let alphanumeric: Vec<u8> = [LOWERCASE, UPPERCASE, DIGITS].concat();
        let mut pool = alphanumeric.clone();
        if self.special_characters {
            pool.extend_from_slice(SPECIAL_CHARACTERS);
        }

        let mut rng = rand::rng();
        loop {
            let mut candidate = String::with_capacity(length);
            candidate.push(alphanumeric[rng.random_range(0..alphanumeric.len())] as char);
            for _ in 1..length {
                candidate.push(pool[rng.random_range(0..pool.len())] as char);
            }
            if self.satisfied_by(&candidate) {
                return candidate;
            }
        }
    }

    /// Whether `password` contains every required character class
    pub fn satisfied_by(&self, password: &str) -> bool {
        let contains = |class: &[u8]| password.bytes().any(|b| class.contains(&b));
        contains(LOWERCASE)
            && contains(UPPERCASE)
            && contains(DIGITS)
            && (!self.special_characters || contains(SPECIAL_CHARACTERS))
    }
}
