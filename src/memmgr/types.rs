//! Small domain types shared across the manager

use std::fmt;
use std::str::FromStr;

/// Readers are identified by the opaque name the bus assigned them.
pub type ReaderId = String;

/// `RRClass` represents a DNS resource record class.
///
/// Only the classes that can appear in a data source configuration are
/// modeled; anything else is rejected when the configuration or a command
/// argument is parsed.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy)]
pub enum RRClass {
    IN,
    CH,
    HS,
}

impl fmt::Display for RRClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = match *self {
            RRClass::IN => "IN",
            RRClass::CH => "CH",
            RRClass::HS => "HS",
        };
        write!(f, "{}", mnemonic)
    }
}

#[derive(Debug, PartialEq)]
pub struct BadRRClass {
    pub mnemonic: String,
}

impl fmt::Display for BadRRClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad class: {}", self.mnemonic)
    }
}

impl std::error::Error for BadRRClass {}

impl FromStr for RRClass {
    type Err = BadRRClass;

    fn from_str(s: &str) -> std::result::Result<RRClass, BadRRClass> {
        match s {
            "IN" => Ok(RRClass::IN),
            "CH" => Ok(RRClass::CH),
            "HS" => Ok(RRClass::HS),
            _ => Err(BadRRClass {
                mnemonic: s.to_string(),
            }),
        }
    }
}

/// A validated absolute DNS zone name.
///
/// Names are normalized to lowercase without the trailing dot; `as_str`
/// returns that normalized form, which is also what keys segment image
/// entries and zone master file names. `Display` prints the absolute form.
#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub struct ZoneName {
    name: String,
}

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, PartialEq)]
pub enum NameError {
    Empty,
    EmptyLabel,
    LabelTooLong(usize),
    NameTooLong(usize),
    BadCharacter(char),
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameError::Empty => write!(f, "empty zone name"),
            NameError::EmptyLabel => write!(f, "empty label in zone name"),
            NameError::LabelTooLong(len) => write!(f, "label of {} octets is too long", len),
            NameError::NameTooLong(len) => write!(f, "name of {} octets is too long", len),
            NameError::BadCharacter(c) => write!(f, "bad character {:?} in zone name", c),
        }
    }
}

impl std::error::Error for NameError {}

impl ZoneName {
    pub fn parse(input: &str) -> std::result::Result<ZoneName, NameError> {
        let trimmed = input.strip_suffix('.').unwrap_or(input);
        if trimmed.is_empty() {
            return Err(NameError::Empty);
        }
        // The stored form keeps the trailing dot off, so the implicit root
        // label still counts toward the wire length limit.
        if trimmed.len() + 1 > MAX_NAME_LEN {
            return Err(NameError::NameTooLong(trimmed.len() + 1));
        }
        for label in trimmed.split('.') {
            if label.is_empty() {
                return Err(NameError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(NameError::LabelTooLong(label.len()));
            }
            for c in label.chars() {
                if !c.is_ascii_graphic() {
                    return Err(NameError::BadCharacter(c));
                }
            }
        }
        Ok(ZoneName {
            name: trimmed.to_ascii_lowercase(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ZoneName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rrclass_round_trip() {
        for (mnemonic, class) in [("IN", RRClass::IN), ("CH", RRClass::CH), ("HS", RRClass::HS)] {
            assert_eq!(Ok(class), mnemonic.parse());
            assert_eq!(mnemonic, class.to_string());
        }
    }

    #[test]
    fn test_rrclass_rejects_unknown() {
        let err = "XX".parse::<RRClass>().unwrap_err();
        assert_eq!("bad class: XX", err.to_string());
        assert!("in".parse::<RRClass>().is_err());
    }

    #[test]
    fn test_zone_name_normalization() {
        let name = ZoneName::parse("Example.COM.").unwrap();
        assert_eq!("example.com", name.as_str());
        assert_eq!("example.com.", name.to_string());
        assert_eq!(name, ZoneName::parse("example.com").unwrap());
    }

    #[test]
    fn test_zone_name_rejects_empty_label() {
        assert_eq!(Err(NameError::EmptyLabel), ZoneName::parse("bad..name"));
        assert_eq!(Err(NameError::Empty), ZoneName::parse(""));
        assert_eq!(Err(NameError::Empty), ZoneName::parse("."));
    }

    #[test]
    fn test_zone_name_limits() {
        let long_label = "a".repeat(64);
        assert_eq!(
            Err(NameError::LabelTooLong(64)),
            ZoneName::parse(&long_label)
        );

        let label = "a".repeat(63);
        let long_name = format!("{}.{}.{}.{}.{}", label, label, label, label, label);
        assert!(matches!(
            ZoneName::parse(&long_name),
            Err(NameError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_zone_name_rejects_whitespace() {
        assert_eq!(
            Err(NameError::BadCharacter(' ')),
            ZoneName::parse("bad name.example")
        );
    }
}
