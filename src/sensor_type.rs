//! Mapping from database sensor-type names to archive file tokens.
//!
//! Type names in the database are free text ("SDS011", "Nova SDS-011",
//! "PMS5003 v2"). The archive names its files with a short lowercase token.
//! A name maps only when exactly one known token occurs in it; names with no
//! token or with several are reported as unsupported instead of guessed.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArchiveType {
    Sds011,
    Dht22,
    Bmp180,
    Bme280,
    Hpm,
    Pms3003,
    Pms5003,
    Pms7003,
}

impl ArchiveType {
    /// Every supported type, in lookup order
    pub const ALL: [ArchiveType; 8] = [
        ArchiveType::Sds011,
        ArchiveType::Dht22,
        ArchiveType::Bmp180,
        ArchiveType::Bme280,
        ArchiveType::Hpm,
        ArchiveType::Pms3003,
        ArchiveType::Pms5003,
        ArchiveType::Pms7003,
    ];

    /// Types probed when a download does not name one
    pub const COMMON: [ArchiveType; 3] = [ArchiveType::Sds011, ArchiveType::Dht22, ArchiveType::Bmp180];

    pub fn token(&self) -> &'static str {
        match self {
            ArchiveType::Sds011 => "sds011",
            ArchiveType::Dht22 => "dht22",
            ArchiveType::Bmp180 => "bmp180",
            ArchiveType::Bme280 => "bme280",
            ArchiveType::Hpm => "hpm",
            ArchiveType::Pms3003 => "pms3003",
            ArchiveType::Pms5003 => "pms5003",
            ArchiveType::Pms7003 => "pms7003",
        }
    }

    /// Resolve a database sensor-type name
    pub fn from_type_name(name: &str) -> Result<ArchiveType, UnsupportedType> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        let matches: Vec<ArchiveType> = Self::ALL
            .iter()
            .copied()
            .filter(|t| normalized.contains(t.token()))
            .collect();

        match matches.as_slice() {
            [single] => Ok(*single),
            [] => Err(UnsupportedType {
                name: name.to_string(),
                candidates: Vec::new(),
            }),
            _ => Err(UnsupportedType {
                name: name.to_string(),
                candidates: matches,
            }),
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ArchiveType {
    type Err = UnsupportedType;

    /// Parse an exact archive token such as `sds011`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.token().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnsupportedType {
                name: s.to_string(),
                candidates: Vec::new(),
            })
    }
}

/// A sensor-type name with no single archive token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedType {
    pub name: String,
    /// Empty when nothing matched; two or more when the name is ambiguous
    pub candidates: Vec<ArchiveType>,
}

impl UnsupportedType {
    pub fn is_ambiguous(&self) -> bool {
        self.candidates.len() > 1
    }
}

impl fmt::Display for UnsupportedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ambiguous() {
            let tokens: Vec<&str> = self.candidates.iter().map(|t| t.token()).collect();
            write!(f, "'{}' is ambiguous (matches {})", self.name, tokens.join(", "))
        } else {
            write!(f, "'{}' has no archive equivalent", self.name)
        }
    }
}
