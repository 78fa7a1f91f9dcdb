// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Value generators for `defaultfunc` and uniquify.
use rand::seq::SliceRandom;

use super::{Transaction, TxError};
use crate::store::Repository;
use crate::template::Generator;

const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

/// `length` characters drawn uniformly from `alphabet`.
pub(crate) fn random_string(length: usize, alphabet: &str) -> String {
    let chars: Vec<char> = alphabet.chars().collect();
    let mut rng = rand::thread_rng();
    (0..length)
        .filter_map(|_| chars.choose(&mut rng))
        .collect()
}

/// Increments the run of ASCII digits ending `value`, widening on carry
/// (`a9` → `a10`, `a007` → `a008`). A value without trailing digits gets
/// `1` appended.
pub(crate) fn inc_digits_end(value: &str) -> String {
    let digits = value.chars().rev().take_while(char::is_ascii_digit).count();
    let (stem, tail) = value.split_at(value.len() - digits);
    if tail.is_empty() {
        return format!("{stem}1");
    }
    let mut bytes = tail.as_bytes().to_vec();
    let mut carry = true;
    for b in bytes.iter_mut().rev() {
        if *b == b'9' {
            *b = b'0';
        } else {
            *b += 1;
            carry = false;
            break;
        }
    }
    if carry {
        bytes.insert(0, b'1');
    }
    format!("{stem}{}", String::from_utf8_lossy(&bytes))
}

impl<S: Repository> Transaction<'_, S> {
    /// One candidate from `generator`, not yet checked for uniqueness.
    pub(crate) fn draw(&self, generator: &Generator) -> String {
        let fallback = self.config().generator_length;
        match generator {
            Generator::RandomUnique { length, alphabet } => random_string(
                length.unwrap_or(fallback),
                alphabet.as_deref().unwrap_or(DEFAULT_ALPHABET),
            ),
            Generator::UserPrefixUnique { length } => format!(
                "{}-{}",
                self.who,
                random_string(length.unwrap_or(fallback), DEFAULT_ALPHABET)
            ),
        }
    }

    /// Draws until the candidate is held by no live record of `rectype`.
    ///
    /// # Errors
    ///
    /// [`TxError::GeneratorExhausted`] after the configured number of tries.
    pub(crate) fn generate_unique(
        &self,
        rectype: &str,
        field: &str,
        generator: &Generator,
    ) -> Result<String, TxError> {
        let attempts = self.config().generator_attempts.max(1);
        for _ in 0..attempts {
            let candidate = self.draw(generator);
            if self.value_holders(rectype, field, &candidate)?.is_empty() {
                return Ok(candidate);
            }
        }
        Err(TxError::GeneratorExhausted {
            rectype: rectype.to_owned(),
            field: field.to_owned(),
            attempts,
        })
    }
}
