//! # kagi-mnemonic
//!
//! BIP39 mnemonic encoding for peer seeds: 16 or 32 bytes of entropy become
//! 12 or 24 English words carrying a SHA-256 checksum, and back. The seed is
//! exactly the entropy: `from_phrase(m.phrase())` returns the bytes that
//! produced `m`, and tampering with any word fails validation.
//!
//! Only the English wordlist comes from the `bip39` crate; the encoding,
//! checksum, and validation are implemented here because the seed handling
//! sits on the kernel's trust surface.

use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bits per mnemonic word.
const WORD_BITS: usize = 11;

/// The 2048-word English list (sorted, so lookup is a binary search).
fn word_list() -> &'static [&'static str; 2048] {
    bip39::Language::English.word_list()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MnemonicError {
    #[error("entropy must be 16 or 32 bytes, got {0}")]
    BadEntropyLength(usize),
    #[error("mnemonic must have 12 or 24 words, got {0}")]
    BadWordCount(usize),
    #[error("unknown word: {0:?}")]
    UnknownWord(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// A validated mnemonic and the entropy it encodes.
#[derive(Clone, PartialEq, Eq)]
pub struct Mnemonic {
    entropy: Vec<u8>,
    words: Vec<&'static str>,
}

impl Mnemonic {
    /// Encode entropy (16 or 32 bytes) as a mnemonic.
    pub fn from_entropy(entropy: &[u8]) -> Result<Self, MnemonicError> {
        if entropy.len() != 16 && entropy.len() != 32 {
            return Err(MnemonicError::BadEntropyLength(entropy.len()));
        }
        let checksum_bits = entropy.len() / 4; // 4 bits per 16 bytes
        let checksum = Sha256::digest(entropy)[0];

        // entropy bits followed by the leading checksum bits
        let total_bits = entropy.len() * 8 + checksum_bits;
        let word_count = total_bits / WORD_BITS;
        let mut words = Vec::with_capacity(word_count);
        let bit_at = |i: usize| -> u16 {
            let byte = if i < entropy.len() * 8 {
                entropy[i / 8]
            } else {
                checksum
            };
            let offset = if i < entropy.len() * 8 {
                i % 8
            } else {
                i - entropy.len() * 8
            };
            ((byte >> (7 - offset)) & 1) as u16
        };
        for w in 0..word_count {
            let mut index = 0u16;
            for b in 0..WORD_BITS {
                index = (index << 1) | bit_at(w * WORD_BITS + b);
            }
            words.push(word_list()[index as usize]);
        }
        Ok(Self {
            entropy: entropy.to_vec(),
            words,
        })
    }

    /// A fresh random mnemonic of 12 or 24 words.
    pub fn generate(word_count: usize) -> Result<Self, MnemonicError> {
        let entropy_len = match word_count {
            12 => 16,
            24 => 32,
            other => return Err(MnemonicError::BadWordCount(other)),
        };
        let mut entropy = vec![0u8; entropy_len];
        rand::thread_rng().fill_bytes(&mut entropy);
        Self::from_entropy(&entropy)
    }

    /// Parse and validate a phrase, recovering its entropy.
    pub fn from_phrase(phrase: &str) -> Result<Self, MnemonicError> {
        let list = word_list();
        let words: Vec<&str> = phrase.split_whitespace().collect();
        if words.len() != 12 && words.len() != 24 {
            return Err(MnemonicError::BadWordCount(words.len()));
        }
        let mut indices = Vec::with_capacity(words.len());
        for word in &words {
            let index = list
                .binary_search(word)
                .map_err(|_| MnemonicError::UnknownWord(word.to_string()))?;
            indices.push(index as u16);
        }

        let total_bits = words.len() * WORD_BITS;
        let checksum_bits = total_bits / 33; // 4 for 12 words, 8 for 24
        let entropy_len = (total_bits - checksum_bits) / 8;
        let mut bits = Vec::with_capacity(total_bits);
        for index in &indices {
            for b in (0..WORD_BITS).rev() {
                bits.push(((index >> b) & 1) as u8);
            }
        }
        let mut entropy = vec![0u8; entropy_len];
        for (i, chunk) in bits[..entropy_len * 8].chunks(8).enumerate() {
            entropy[i] = chunk.iter().fold(0, |acc, bit| (acc << 1) | bit);
        }
        let mut checksum = 0u8;
        for &bit in &bits[entropy_len * 8..] {
            checksum = (checksum << 1) | bit;
        }
        let expected = Sha256::digest(&entropy)[0] >> (8 - checksum_bits);
        if checksum != expected {
            return Err(MnemonicError::ChecksumMismatch);
        }
        Ok(Self {
            entropy,
            words: indices
                .into_iter()
                .map(|i| list[i as usize])
                .collect(),
        })
    }

    /// True when the phrase is well formed and its checksum holds.
    pub fn validate(phrase: &str) -> bool {
        Self::from_phrase(phrase).is_ok()
    }

    /// The space-joined word phrase.
    pub fn phrase(&self) -> String {
        self.words.join(" ")
    }

    pub fn words(&self) -> &[&'static str] {
        &self.words
    }

    /// The seed bytes this mnemonic encodes.
    pub fn entropy(&self) -> &[u8] {
        &self.entropy
    }
}

impl fmt::Debug for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log seed material
        write!(f, "Mnemonic({} words)", self.words.len())
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.phrase())
    }
}

// ============================================================================
// Tests
// ============================================================================
