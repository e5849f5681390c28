use std::fmt;
use std::str::FromStr;

const DISPLAY_PREFIX: &str = "MA-";
const MIN_LEN: usize = 8;
const MAX_LEN: usize = 26;
const GROUP: usize = 4;

/// Identifier of a Music Assistant server reachable through the signaling
/// service. Always 8 to 26 characters of `A-Z0-9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteId {
    raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid remote id {0:?}: expected 8-26 characters of A-Z or 0-9")]
pub struct InvalidRemoteId(pub String);

impl RemoteId {
    /// Wraps an already-normalized id. Unlike [`RemoteId::parse`] this does
    /// not strip dashes or fold case.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidRemoteId> {
        let raw = raw.into();
        if is_raw_id(&raw) {
            Ok(Self { raw })
        } else {
            Err(InvalidRemoteId(raw))
        }
    }

    /// Accepts user input such as `ma-vvpn-3tlp`, `MA-VVPN3TLP...` or the bare
    /// id. Returns `None` when the cleaned input is not a valid id.
    pub fn parse(input: &str) -> Option<Self> {
        let body = match input.get(..DISPLAY_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(DISPLAY_PREFIX) => {
                &input[DISPLAY_PREFIX.len()..]
            }
            _ => input,
        };
        let cleaned: String = body
            .chars()
            .filter(|ch| *ch != '-')
            .flat_map(char::to_uppercase)
            .collect();
        is_raw_id(&cleaned).then_some(Self { raw: cleaned })
    }

    pub fn is_valid(input: &str) -> bool {
        Self::parse(input).is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }

    /// Short display form built from the first eight characters,
    /// e.g. `MA-VVPN-3TLP`. Lossy for ids longer than eight characters.
    pub fn formatted(&self) -> String {
        let head = &self.raw[..MIN_LEN];
        format!("{DISPLAY_PREFIX}{}-{}", &head[..GROUP], &head[GROUP..])
    }

    /// Full display form, e.g. `MA-VVPN-3TLP-34YM-GIZD-INCE-KQKS-IR`.
    pub fn full_formatted(&self) -> String {
        let chars: Vec<char> = self.raw.chars().collect();
        let groups: Vec<String> = chars
            .chunks(GROUP)
            .map(|chunk| chunk.iter().collect())
            .collect();
        format!("{DISPLAY_PREFIX}{}", groups.join("-"))
    }
}

fn is_raw_id(candidate: &str) -> bool {
    (MIN_LEN..=MAX_LEN).contains(&candidate.len())
        && candidate
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

impl FromStr for RemoteId {
    type Err = InvalidRemoteId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidRemoteId(s.to_owned()))
    }
}

impl AsRef<str> for RemoteId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "VVPN3TLP34YMGIZDINCEKQKSIR";

    #[test]
    fn parses_every_display_variant() {
        let expected = RemoteId::new(FULL).unwrap();
        for input in [
            FULL,
            "vvpn3tlp34ymgizdincekqksir",
            "MA-VVPN-3TLP-34YM-GIZD-INCE-KQKS-IR",
            "ma-vvpn-3tlp-34ym-gizd-ince-kqks-ir",
            "Ma-VVPN3TLP34YMGIZDINCEKQKSIR",
            "VVPN-3TLP-34YM-GIZD-INCE-KQKS-IR",
        ] {
            assert_eq!(RemoteId::parse(input), Some(expected.clone()), "{input}");
        }
    }

    #[test]
    fn rejects_garbage() {
        for input in [
            "",
            "MA-",
            "ABC",
            "ABCDEFG",
            "ABCDEFGHIJKLMNOPQRSTUVWXYZ0",
            "ABCD EFGH",
            "ABCD_EFGH",
            "ÄBCDEFGH",
            "MA-ABCD-EFG!",
        ] {
            assert!(RemoteId::parse(input).is_none(), "{input:?}");
            assert!(!RemoteId::is_valid(input), "{input:?}");
        }
    }

    #[test]
    fn prefix_is_only_stripped_once() {
        // "MA" stays part of the id when it is not followed by a dash.
        let id = RemoteId::parse("MAABCDEF").unwrap();
        assert_eq!(id.as_str(), "MAABCDEF");
        let id = RemoteId::parse("MA-MA-ABCDEF").unwrap();
        assert_eq!(id.as_str(), "MAABCDEF");
    }

    #[test]
    fn new_does_not_normalize() {
        assert!(RemoteId::new("vvpn3tlp").is_err());
        assert!(RemoteId::new("VVPN-3TLP").is_err());
        assert_eq!(RemoteId::new("VVPN3TLP").unwrap().as_str(), "VVPN3TLP");
    }

    #[test]
    fn formats_short_and_full() {
        let id = RemoteId::new(FULL).unwrap();
        assert_eq!(id.formatted(), "MA-VVPN-3TLP");
        assert_eq!(id.full_formatted(), "MA-VVPN-3TLP-34YM-GIZD-INCE-KQKS-IR");
        assert_eq!(id.to_string(), "MA-VVPN-3TLP");

        let short = RemoteId::new("ABCD1234").unwrap();
        assert_eq!(short.formatted(), "MA-ABCD-1234");
        assert_eq!(short.full_formatted(), "MA-ABCD-1234");
    }

    #[test]
    fn full_format_parses_back_for_every_length() {
        let alphabet: Vec<char> = ('A'..='Z').chain('0'..='9').collect();
        for len in MIN_LEN..=MAX_LEN {
            let raw: String = (0..len)
                .map(|i| alphabet[(i * 7 + len) % alphabet.len()])
                .collect();
            let id = RemoteId::new(raw.clone()).unwrap();
            assert_eq!(RemoteId::parse(&id.full_formatted()), Some(id.clone()));
            assert_eq!(id.formatted().len(), DISPLAY_PREFIX.len() + MIN_LEN + 1);
        }
    }

    #[test]
    fn from_str_reports_input() {
        let err = "nope".parse::<RemoteId>().unwrap_err();
        assert_eq!(err, InvalidRemoteId("nope".into()));
    }
}
