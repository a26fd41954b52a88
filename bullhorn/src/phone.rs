//! Phone number normalization and SMS segment arithmetic.
//!
//! Numbers are stored and sent exclusively in E.164 form. Normalization is
//! deliberately forgiving about input punctuation (`(555) 123-4567` and
//! `555.123.4567` both normalize) but strict about the result: anything that
//! does not come out as a valid E.164 number is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// An E.164-formatted phone number: a leading `+`, a country code starting
/// with 1-9, and at most 15 digits total.
///
/// Only constructible through [`normalize`], so holding an `E164` means the
/// number already passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct E164(String);

impl E164 {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a string that is already known to be E.164, e.g. read back from
    /// a store column that was written through [`normalize`].
    pub(crate) fn from_trusted(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<E164> for String {
    fn from(number: E164) -> Self {
        number.0
    }
}

/// Normalize raw user input into an E.164 number.
///
/// Strips every non-digit character, then:
/// - 10 digits are treated as a US national number and prefixed with `+1`
/// - 11 digits with a leading `1` get a `+` prefix
/// - anything else gets a `+` prefix as-is
///
/// Fails with [`EngineError::InvalidPhoneNumber`] if the result is not a
/// valid E.164 number. Idempotent for any input that normalizes successfully.
pub fn normalize(raw: &str) -> Result<E164, EngineError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let candidate = if digits.len() == 10 {
        format!("+1{digits}")
    } else if digits.len() == 11 && digits.starts_with('1') {
        format!("+{digits}")
    } else {
        format!("+{digits}")
    };

    if is_valid_e164(&candidate) {
        Ok(E164(candidate))
    } else {
        Err(EngineError::InvalidPhoneNumber {
            input: raw.to_string(),
        })
    }
}

/// `^\+[1-9]\d{1,14}$`
fn is_valid_e164(s: &str) -> bool {
    let Some(rest) = s.strip_prefix('+') else {
        return false;
    };
    if rest.len() < 2 || rest.len() > 15 {
        return false;
    }
    let mut chars = rest.chars();
    matches!(chars.next(), Some('1'..='9')) && chars.all(|c| c.is_ascii_digit())
}

/// Number of SMS segments a message body occupies.
///
/// Single-part messages carry up to 160 characters; a two-part concatenated
/// message carries up to 306 (2 x 153); beyond that each part carries 153.
/// This is the carrier billing model, used for cost/length display only --
/// wire encoding is the provider's problem.
pub fn segment_count(body: &str) -> u32 {
    let len = body.chars().count();
    if len <= 160 {
        1
    } else if len <= 306 {
        2
    } else {
        (len as u32).div_ceil(153)
    }
}
