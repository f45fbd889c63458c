//! Transfer codes: short human-entered strings, and the registry that hands them out.

use std::collections::HashMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ShareError;

/// Code alphabet: A-Z and 2-9 without the look-alikes 0/O and 1/I. 32 symbols.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Characters per code. 32^6 is about 1.07 billion codes.
pub const CODE_LENGTH: usize = 6;

/// Default number of random draws before allocation reports `CapacityExhausted`.
pub const DEFAULT_CODE_ATTEMPTS: u32 = 20;

/// A transfer code, always stored normalised (uppercase, alphabet-only).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferCode(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeParseError {
    #[error("code must be 6 characters, got {0}")]
    Length(usize),
    #[error("invalid character {0:?} in code")]
    Character(char),
}

impl TransferCode {
    /// Parse user input: surrounding whitespace is ignored and letters are uppercased.
    pub fn parse(input: &str) -> Result<Self, CodeParseError> {
        let normalised = input.trim().to_ascii_uppercase();
        let len = normalised.chars().count();
        if len != CODE_LENGTH {
            return Err(CodeParseError::Length(len));
        }
        if let Some(bad) = normalised
            .chars()
            .find(|c| !c.is_ascii() || !CODE_ALPHABET.contains(&(*c as u8)))
        {
            return Err(CodeParseError::Character(bad));
        }
        Ok(TransferCode(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        let code = (0..len)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        TransferCode(code)
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TransferCode {
    type Error = CodeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        TransferCode::parse(&s)
    }
}

impl From<TransferCode> for String {
    fn from(code: TransferCode) -> Self {
        code.0
    }
}

/// Maps codes in use to the value they identify (the manager stores session IDs).
///
/// A code is reserved by `allocate` and stays reserved until `release`, whether or not a
/// value has been bound to it yet.
pub struct CodeRegistry<V> {
    codes: HashMap<TransferCode, Option<V>>,
    max_attempts: u32,
    code_len: usize,
    rng: StdRng,
}

impl<V> CodeRegistry<V> {
    pub fn new(max_attempts: u32) -> Self {
        Self::with_rng(max_attempts, StdRng::from_entropy())
    }

    /// Registry with a caller-supplied RNG (seeded registries give reproducible codes).
    pub fn with_rng(max_attempts: u32, rng: StdRng) -> Self {
        Self {
            codes: HashMap::new(),
            max_attempts: max_attempts.max(1),
            code_len: CODE_LENGTH,
            rng,
        }
    }

    /// Reserve a fresh code. Fails with `CapacityExhausted` when every draw collides.
    pub fn allocate(&mut self) -> Result<TransferCode, ShareError> {
        for attempt in 1..=self.max_attempts {
            let code = TransferCode::random(&mut self.rng, self.code_len);
            if !self.codes.contains_key(&code) {
                if attempt > 1 {
                    tracing::debug!(attempt, "code allocated after collisions");
                }
                self.codes.insert(code.clone(), None);
                return Ok(code);
            }
        }
        tracing::warn!(
            in_use = self.codes.len(),
            attempts = self.max_attempts,
            "code space saturated"
        );
        Err(ShareError::CapacityExhausted)
    }

    /// Attach a value to a reserved code. Returns false if the code is not reserved.
    pub fn bind(&mut self, code: &TransferCode, value: V) -> bool {
        match self.codes.get_mut(code) {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }

    /// Return a code to the pool. Idempotent.
    pub fn release(&mut self, code: &TransferCode) -> Option<V> {
        self.codes.remove(code).flatten()
    }

    pub fn lookup(&self, code: &TransferCode) -> Option<&V> {
        self.codes.get(code).and_then(Option::as_ref)
    }

    pub fn is_allocated(&self, code: &TransferCode) -> bool {
        self.codes.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn clear(&mut self) {
        self.codes.clear();
    }
}

impl<V> Default for CodeRegistry<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn single_char_registry(attempts: u32) -> CodeRegistry<u32> {
        let mut r = CodeRegistry::with_rng(attempts, StdRng::seed_from_u64(7));
        r.code_len = 1;
        r
    }

    #[test]
    fn allocated_codes_use_alphabet() {
        let mut r: CodeRegistry<u32> = CodeRegistry::default();
        for _ in 0..200 {
            let code = r.allocate().unwrap();
            assert_eq!(code.as_str().len(), CODE_LENGTH);
            assert!(code.as_str().bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert!(TransferCode::parse(code.as_str()).is_ok());
        }
    }

    #[test]
    fn codes_unique_while_allocated() {
        let mut r: CodeRegistry<u32> = CodeRegistry::default();
        let mut seen = HashSet::new();
        for i in 0..1000 {
            let code = r.allocate().unwrap();
            assert!(r.bind(&code, i));
            assert!(seen.insert(code));
        }
        assert_eq!(r.len(), 1000);
    }

    #[test]
    fn lookup_returns_bound_value() {
        let mut r = CodeRegistry::default();
        let code = r.allocate().unwrap();
        assert_eq!(r.lookup(&code), None);
        assert!(r.is_allocated(&code));
        r.bind(&code, "session-a");
        assert_eq!(r.lookup(&code), Some(&"session-a"));
    }

    #[test]
    fn bind_unreserved_code_fails() {
        let mut r = CodeRegistry::default();
        let code = TransferCode::parse("ZZZZZZ").unwrap();
        assert!(!r.bind(&code, 1));
        assert_eq!(r.lookup(&code), None);
    }

    #[test]
    fn release_is_idempotent() {
        let mut r = CodeRegistry::default();
        let code = r.allocate().unwrap();
        r.bind(&code, 5);
        assert_eq!(r.release(&code), Some(5));
        assert_eq!(r.release(&code), None);
        assert!(!r.is_allocated(&code));
        assert!(r.is_empty());
    }

    #[test]
    fn saturated_space_reports_capacity_exhausted() {
        let mut r = single_char_registry(20);
        for &b in CODE_ALPHABET.iter() {
            let code = TransferCode((b as char).to_string());
            r.codes.insert(code, Some(0));
        }
        assert!(matches!(r.allocate(), Err(ShareError::CapacityExhausted)));
    }

    #[test]
    fn released_code_is_allocatable_again() {
        let mut r = single_char_registry(1000);
        for &b in CODE_ALPHABET.iter().skip(1) {
            r.codes.insert(TransferCode((b as char).to_string()), Some(0));
        }
        let only = r.allocate().unwrap();
        assert_eq!(only.as_str(), "A");
        assert!(matches!(r.allocate(), Err(ShareError::CapacityExhausted)));
        r.release(&only);
        assert_eq!(r.allocate().unwrap(), only);
    }

    #[test]
    fn parse_normalises_input() {
        let code = TransferCode::parse("  abc234 ").unwrap();
        assert_eq!(code.as_str(), "ABC234");
    }

    #[test]
    fn parse_rejects_ambiguous_and_wrong_length() {
        assert_eq!(
            TransferCode::parse("AB1CDE"),
            Err(CodeParseError::Character('1'))
        );
        assert_eq!(
            TransferCode::parse("ABOCDE"),
            Err(CodeParseError::Character('O'))
        );
        assert_eq!(TransferCode::parse("ABCDE"), Err(CodeParseError::Length(5)));
        assert_eq!(TransferCode::parse(""), Err(CodeParseError::Length(0)));
        assert!(matches!(
            TransferCode::parse("ABCDÉ2"),
            Err(CodeParseError::Character('É'))
        ));
    }

    #[test]
    fn serde_rejects_malformed_code() {
        let good = TransferCode::parse("ZZZZZZ").unwrap();
        let bytes = bincode::serialize(&good).unwrap();
        let back: TransferCode = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, good);

        let bad = bincode::serialize(&"Z0Z0Z0".to_string()).unwrap();
        assert!(bincode::deserialize::<TransferCode>(&bad).is_err());
    }
}
