//! Human readable sizes and durations used by the client configuration.
//!
//! ```
//! use rmqttc_utils::{to_bytesize, to_duration, Bytesize};
//!
//! assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
//! assert_eq!(to_bytesize("256KB"), 262_144);
//! assert_eq!(Bytesize::from("2G512M").string(), "2G512M");
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const BYTESIZE_K: u64 = 1024;
const BYTESIZE_M: u64 = 1024 * BYTESIZE_K;
const BYTESIZE_G: u64 = 1024 * BYTESIZE_M;

const SIZE_UNITS: &[(char, u64)] = &[('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K), ('B', 1)];

// 'Y' stands in for "ms" once the text is normalized
const DURATION_UNITS: &[(char, u64)] = &[
    ('f', 1_209_600_000),
    ('w', 604_800_000),
    ('d', 86_400_000),
    ('h', 3_600_000),
    ('m', 60_000),
    ('s', 1_000),
    ('Y', 1),
];

/// Sums `<number><unit>` segments, e.g. `2G512M` or `1h30m`.
fn parse_units(text: &str, units: &[(char, u64)]) -> Result<u64> {
    let unit_chars: Vec<char> = units.iter().map(|(c, _)| *c).collect();
    text.split_inclusive(unit_chars.as_slice()).try_fold(0u64, |total, segment| {
        let mut chars = segment.chars();
        let unit = chars.next_back().ok_or_else(|| anyhow!("empty segment"))?;
        let factor = units
            .iter()
            .find_map(|(c, f)| (*c == unit).then_some(*f))
            .ok_or_else(|| anyhow!("missing unit in {:?}", segment))?;
        let value: u64 = chars.as_str().trim().parse().map_err(|e| anyhow!("invalid number in {:?}: {}", segment, e))?;
        value
            .checked_mul(factor)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| anyhow!("{:?} overflows", text))
    })
}

/// Parses a byte size such as `2G512M`, `256KB` or `1024B`.
pub fn try_to_bytesize(text: &str) -> Result<usize> {
    let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    if let Ok(bytes) = text.parse::<usize>() {
        return Ok(bytes);
    }
    let bytes = parse_units(&text, SIZE_UNITS)?;
    usize::try_from(bytes).map_err(|_| anyhow!("{:?} does not fit usize", text))
}

/// Lenient form of [`try_to_bytesize`], invalid text yields 0.
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    try_to_bytesize(text).unwrap_or_default()
}

/// Parses a duration such as `1h30m15s` or `500ms`; a bare number is seconds.
pub fn try_to_duration(text: &str) -> Result<Duration> {
    let text = text.trim().to_lowercase();
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    parse_units(&text.replace("ms", "Y"), DURATION_UNITS).map(Duration::from_millis)
}

/// Lenient form of [`try_to_duration`], invalid text yields a zero duration.
#[inline]
pub fn to_duration(text: &str) -> Duration {
    try_to_duration(text).unwrap_or_default()
}

/// serde helper: duration from a string like `"30s"`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    try_to_duration(&v).map_err(de::Error::custom)
}

/// serde helper: an empty string means no duration.
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.trim().is_empty() {
        Ok(None)
    } else {
        try_to_duration(&v).map(Some).map_err(de::Error::custom)
    }
}

/// serde helper: writes a duration back as milliseconds, `"1500ms"`.
pub fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&format!("{}ms", d.as_millis()))
}

/// Byte size that (de)serializes as `2G512M` style text.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u32(&self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn string(&self) -> String {
        let mut rest = self.0 as u64;
        let mut res = String::new();
        for (unit, factor) in SIZE_UNITS {
            let n = rest / factor;
            if n > 0 {
                res.push_str(&format!("{}{}", n, unit));
                rest %= factor;
            }
        }
        if res.is_empty() {
            res.push_str("0B");
        }
        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(usize),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => Ok(Bytesize(v)),
            Raw::Text(v) => try_to_bytesize(&v).map(Bytesize).map_err(de::Error::custom),
        }
    }
}
