//! String-length semantics strategies.
//!
//! Different engines measure column lengths in different units: bytes,
//! Unicode code points, or UTF-16 code units. The capability prober selects
//! one strategy per handle; callers use it to pre-truncate values so the
//! engine never rejects or silently mangles them.
//!
//! Every strategy guarantees `length(truncate(s, n)) <= n` under its own
//! measurement rule and never cuts inside a code point, so a UTF-16
//! surrogate pair is either kept whole or dropped whole.

/// Unit in which an engine measures string column lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSemantics {
    /// Raw byte count of the UTF-8 encoding. The conservative default.
    #[default]
    Bytes,
    /// Unicode code points (characters).
    CodePoints,
    /// UTF-16 code units; astral characters count as two.
    Utf16Units,
}

impl LengthSemantics {
    /// Measured length of `s` under this strategy.
    pub fn length(&self, s: &str) -> usize {
        match self {
            Self::Bytes => s.len(),
            Self::CodePoints => s.chars().count(),
            Self::Utf16Units => s.encode_utf16().count(),
        }
    }

    /// Longest prefix of `s` whose measured length is at most `max`.
    pub fn truncate<'a>(&self, s: &'a str, max: usize) -> &'a str {
        let mut used = 0usize;
        let mut end = 0usize;
        for (idx, c) in s.char_indices() {
            let width = match self {
                Self::Bytes => c.len_utf8(),
                Self::CodePoints => 1,
                Self::Utf16Units => c.len_utf16(),
            };
            if used + width > max {
                return &s[..end];
            }
            used += width;
            end = idx + c.len_utf8();
        }
        s
    }

    /// Whether `s` fits a column of `max` length units.
    pub fn fits(&self, s: &str, max: usize) -> bool {
        self.length(s) <= max
    }
}

impl std::fmt::Display for LengthSemantics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes => write!(f, "bytes"),
            Self::CodePoints => write!(f, "code points"),
            Self::Utf16Units => write!(f, "utf-16 units"),
        }
    }
}
