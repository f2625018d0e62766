// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Character sets a source file may be written in.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

const REPLACEMENT: char = '\u{FFFD}';

/// Encodings supported for source records and upload bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Charset {
    #[default]
    Utf8,
    Iso8859_1,
    UsAscii,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported charset: {0}")]
pub struct UnknownCharset(pub String);

impl Charset {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Iso8859_1 => "ISO-8859-1",
            Charset::UsAscii => "US-ASCII",
        }
    }

    /// Decodes a raw record. Bytes that are invalid in this charset become
    /// U+FFFD.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Iso8859_1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Charset::UsAscii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { char::from(b) } else { REPLACEMENT })
                .collect(),
        }
    }

    /// Encodes a payload for upload. Characters this charset cannot represent
    /// become `?`.
    #[must_use]
    pub fn encode(self, text: &str) -> Cow<'_, [u8]> {
        match self {
            Charset::Utf8 => Cow::Borrowed(text.as_bytes()),
            Charset::UsAscii if text.is_ascii() => Cow::Borrowed(text.as_bytes()),
            Charset::UsAscii => Cow::Owned(
                text.chars()
                    .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                    .collect(),
            ),
            Charset::Iso8859_1 => Cow::Owned(
                text.chars()
                    .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                    .collect(),
            ),
        }
    }
}

impl FromStr for Charset {
    type Err = UnknownCharset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('_', "-");
        match normalized.as_str() {
            "UTF-8" | "UTF8" => Ok(Charset::Utf8),
            "ISO-8859-1" | "ISO8859-1" | "LATIN1" | "LATIN-1" => Ok(Charset::Iso8859_1),
            "US-ASCII" | "ASCII" => Ok(Charset::UsAscii),
            _ => Err(UnknownCharset(s.to_string())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("utf-8".parse::<Charset>(), Ok(Charset::Utf8));
        assert_eq!("UTF8".parse::<Charset>(), Ok(Charset::Utf8));
        assert_eq!("iso_8859_1".parse::<Charset>(), Ok(Charset::Iso8859_1));
        assert_eq!("latin1".parse::<Charset>(), Ok(Charset::Iso8859_1));
        assert_eq!("ascii".parse::<Charset>(), Ok(Charset::UsAscii));
        assert_eq!(
            "EBCDIC".parse::<Charset>(),
            Err(UnknownCharset("EBCDIC".to_string()))
        );
    }

    #[test]
    fn utf8_decoding_is_lossy() {
        assert_eq!(Charset::Utf8.decode(b"ok\xFF"), "ok\u{FFFD}");
    }

    #[test]
    fn latin1_maps_every_byte() {
        assert_eq!(Charset::Iso8859_1.decode(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(Charset::Iso8859_1.encode("café").as_ref(), &[0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(Charset::Iso8859_1.encode("€").as_ref(), b"?");
    }

    #[test]
    fn ascii_replaces_unrepresentable() {
        assert_eq!(Charset::UsAscii.decode(b"a\x80"), "a\u{FFFD}");
        assert_eq!(Charset::UsAscii.encode("naïve").as_ref(), b"na?ve");
        assert!(matches!(Charset::UsAscii.encode("plain"), Cow::Borrowed(_)));
    }
}
