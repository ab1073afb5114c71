//! Identity types for tandem.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one recording session.
///
/// Format: `YYYYMMDD_HHMMSS_<device tag>_<6 hex chars>`. The id doubles as
/// a directory name on the hub, so only `[A-Za-z0-9._-]` is allowed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id from the current local time.
    pub fn generate(device_tag: &str) -> Self {
        let now = Local::now();
        let mut suffix = [0u8; 3];
        if getrandom::getrandom(&mut suffix).is_err() {
            let nanos = now.timestamp_subsec_nanos().to_le_bytes();
            suffix.copy_from_slice(&nanos[..3]);
        }
        Self::generate_at(now.naive_local(), device_tag, suffix)
    }

    /// Build a session id from explicit parts.
    pub fn generate_at(created: NaiveDateTime, device_tag: &str, suffix: [u8; 3]) -> Self {
        let stamp = created.format("%Y%m%d_%H%M%S");
        let tag = sanitize(device_tag);
        Self(format!("{stamp}_{tag}_{}", hex::encode(suffix)))
    }

    /// Validate an id received from a peer.
    ///
    /// Returns `None` for empty ids, `.`/`..`, or ids containing anything
    /// outside `[A-Za-z0-9._-]`.
    pub fn parse(id: &str) -> Option<Self> {
        if id.is_empty() || id == "." || id == ".." {
            return None;
        }
        if id.chars().all(is_safe_char) {
            Some(Self(id.to_string()))
        } else {
            None
        }
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn sanitize(name: &str) -> String {
    safe_component(name, "hub")
}

/// Reduce a free-form name to `[A-Za-z0-9._-]` so it can be used as a single
/// path component. Leading and trailing punctuation is trimmed; `fallback`
/// is returned when nothing is left.
pub fn safe_component(name: &str, fallback: &str) -> String {
    let cleaned: String = name.chars().filter(|c| is_safe_char(*c)).collect();
    let trimmed = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fixed_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 7)
            .unwrap()
    }

    #[test]
    fn session_id_format() {
        let id = SessionId::generate_at(fixed_time(), "pixel-7", [0xab, 0x01, 0xff]);
        assert_eq!(id.as_str(), "20240309_140507_pixel-7_ab01ff");
    }

    #[test]
    fn session_id_sanitizes_device_tag() {
        let id = SessionId::generate_at(fixed_time(), "../Lab PC #2/", [0, 0, 0]);
        assert_eq!(id.as_str(), "20240309_140507_LabPC2_000000");
    }

    #[test]
    fn session_id_empty_tag_falls_back() {
        let id = SessionId::generate_at(fixed_time(), "///", [1, 2, 3]);
        assert_eq!(id.as_str(), "20240309_140507_hub_010203");
    }

    #[test]
    fn generated_ids_differ() {
        let a = SessionId::generate("hub");
        let b = SessionId::generate("hub");
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_are_parseable() {
        let id = SessionId::generate("hub");
        assert_eq!(SessionId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn safe_component_strips_separators() {
        assert_eq!(safe_component("../../etc/passwd", "x"), "etcpasswd");
        assert_eq!(safe_component("s1_dev-1.zip", "x"), "s1_dev-1.zip");
        assert_eq!(safe_component("..", "unknown"), "unknown");
    }

    #[test]
    fn parse_rejects_path_tricks() {
        assert!(SessionId::parse("").is_none());
        assert!(SessionId::parse(".").is_none());
        assert!(SessionId::parse("..").is_none());
        assert!(SessionId::parse("a/b").is_none());
        assert!(SessionId::parse("..\\x").is_none());
        assert!(SessionId::parse("ok_session-1.2").is_some());
    }
}
