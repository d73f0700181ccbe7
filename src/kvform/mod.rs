//! The Key-Value Form encoding used for OpenID direct responses: newline-separated
//! `key:value` pairs, UTF-8 encoded.

use thiserror::Error;

use std::collections::HashSet;

#[cfg(test)]
mod tests;

/// How strictly decoding enforces the Key-Value Form grammar.
///
/// Encoding always emits strictly-conformant output; the levels only relax what is accepted.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ConformanceLevel {
    /// Trim surrounding whitespace and skip blank lines.
    Loose,
    /// OpenID 1.1: whitespace around the separator is rejected, but values are still trimmed.
    OpenId11,
    /// OpenID 2.0: byte-exact, including the trailing newline.
    OpenId20,
}

/// Error encoding or decoding Key-Value Form.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyValueFormError {
    /// A key contains `:` or a newline, or a value contains a newline; these cannot be
    /// represented and must fail at encode time rather than produce corrupt output.
    #[error("`{0}` cannot appear in a key-value form {1}")]
    IllegalCharacter(char, &'static str),
    /// A line has no `:` separator.
    #[error("line {0} is missing a `:` separator")]
    MissingSeparator(usize),
    /// Whitespace adjoins the separator under a strict conformance level.
    #[error("line {0} has whitespace adjoining the `:` separator")]
    IllegalWhitespace(usize),
    /// The same key appeared twice.
    #[error("duplicate key `{0}`")]
    DuplicateKey(String),
    /// Strict conformance requires the final line to end with a newline.
    #[error("missing trailing newline")]
    MissingTrailingNewline,
    /// The input is not valid UTF-8.
    #[error("input is not valid UTF-8")]
    InvalidUtf8,
}

/// Codec for Key-Value Form at a chosen [`ConformanceLevel`].
#[derive(Clone, Copy, Debug)]
pub struct KeyValueFormEncoding {
    level: ConformanceLevel,
}

impl Default for KeyValueFormEncoding {
    fn default() -> Self {
        KeyValueFormEncoding {
            level: ConformanceLevel::Loose,
        }
    }
}

impl KeyValueFormEncoding {
    /// Create a codec decoding at the given conformance level.
    pub fn new(level: ConformanceLevel) -> Self {
        KeyValueFormEncoding { level }
    }

    /// The conformance level this codec decodes at.
    pub fn level(&self) -> ConformanceLevel {
        self.level
    }

    /// Encode pairs in the given order. Fails if any key contains `:` or a newline, or any
    /// value contains a newline.
    pub fn encode<'a, I>(pairs: I) -> Result<Vec<u8>, KeyValueFormError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut out = String::new();
        for (key, value) in pairs {
            if key.contains('\n') {
                return Err(KeyValueFormError::IllegalCharacter('\n', "key"));
            }
            if key.contains(':') {
                return Err(KeyValueFormError::IllegalCharacter(':', "key"));
            }
            if value.contains('\n') {
                return Err(KeyValueFormError::IllegalCharacter('\n', "value"));
            }
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    /// Decode pairs in wire order, enforcing this codec's conformance level.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<(String, String)>, KeyValueFormError> {
        let text = std::str::from_utf8(data).map_err(|_| KeyValueFormError::InvalidUtf8)?;

        if self.level > ConformanceLevel::Loose && !text.is_empty() && !text.ends_with('\n') {
            return Err(KeyValueFormError::MissingTrailingNewline);
        }

        let mut lines: Vec<&str> = text.split('\n').collect();
        // A conformant document ends with '\n', leaving one empty trailing segment.
        if lines.last() == Some(&"") {
            lines.pop();
        }

        let mut pairs = Vec::new();
        let mut seen = HashSet::new();
        for (index, mut line) in lines.into_iter().enumerate() {
            let line_num = index + 1;
            if self.level == ConformanceLevel::Loose {
                line = line.trim();
                if line.is_empty() {
                    continue;
                }
            }

            let (mut key, mut value) = line
                .split_once(':')
                .ok_or(KeyValueFormError::MissingSeparator(line_num))?;

            if self.level > ConformanceLevel::Loose
                && (key.ends_with(char::is_whitespace) || value.starts_with(char::is_whitespace))
            {
                return Err(KeyValueFormError::IllegalWhitespace(line_num));
            }
            if self.level < ConformanceLevel::OpenId20 {
                key = key.trim();
                value = value.trim();
            }

            if !seen.insert(key.to_owned()) {
                return Err(KeyValueFormError::DuplicateKey(key.to_owned()));
            }
            pairs.push((key.to_owned(), value.to_owned()));
        }
        Ok(pairs)
    }
}
