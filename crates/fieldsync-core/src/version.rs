use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{REV_COLUMN, VERSION_CHAIN_COLUMN, VERSION_NUM_COLUMN};
use crate::{CoreError, Row};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Previous,
    Next,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Previous => "previous",
            Self::Next => "next",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "previous" | "prev" => Some(Self::Previous),
            "next" => Some(Self::Next),
            _ => None,
        }
    }

    /// Neighbouring version number, `None` below the first version.
    #[must_use]
    pub fn target(self, version_num: i64) -> Option<i64> {
        let target = match self {
            Self::Previous => version_num.checked_sub(1)?,
            Self::Next => version_num.checked_add(1)?,
        };
        (target >= 1).then_some(target)
    }
}

/// Version fields the store injects into rows of versioned tables.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionStamp {
    pub version_chain_id: String,
    pub version_num: i64,
    pub rev: i64,
}

impl VersionStamp {
    /// First row of a chain: the chain is named after that row.
    #[must_use]
    pub fn first(id: &str) -> Self {
        Self { version_chain_id: id.to_string(), version_num: 1, rev: 1 }
    }

    /// Stamp for the version following `base`; `rev` starts over.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the chain has no version number left.
    pub fn successor_of(base: &Self) -> Result<Self, CoreError> {
        let version_num = base.version_num.checked_add(1).ok_or_else(|| {
            CoreError::Validation(format!("version chain {} is at its last version number", base.version_chain_id))
        })?;
        Ok(Self { version_chain_id: base.version_chain_id.clone(), version_num, rev: 1 })
    }

    /// Read the stamp of a stored row.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when a version field is missing or mistyped.
    pub fn from_row(row: &Row) -> Result<Self, CoreError> {
        let version_chain_id = row
            .get(VERSION_CHAIN_COLUMN)
            .and_then(Value::as_str)
            .ok_or_else(|| missing(VERSION_CHAIN_COLUMN))?
            .to_string();
        let version_num =
            row.get(VERSION_NUM_COLUMN).and_then(Value::as_i64).ok_or_else(|| missing(VERSION_NUM_COLUMN))?;
        let rev = row.get(REV_COLUMN).and_then(Value::as_i64).ok_or_else(|| missing(REV_COLUMN))?;
        Ok(Self { version_chain_id, version_num, rev })
    }

    pub fn apply(&self, row: &mut Row) {
        row.insert(VERSION_CHAIN_COLUMN.to_string(), Value::String(self.version_chain_id.clone()));
        row.insert(VERSION_NUM_COLUMN.to_string(), Value::from(self.version_num));
        row.insert(REV_COLUMN.to_string(), Value::from(self.rev));
    }
}

fn missing(column: &str) -> CoreError {
    CoreError::Validation(format!("row is missing a valid {column}"))
}

/// Drop caller-supplied version fields; only the store assigns them.
pub fn strip_version_fields(row: &mut Row) {
    for column in [VERSION_CHAIN_COLUMN, VERSION_NUM_COLUMN, REV_COLUMN] {
        row.remove(column);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn direction_targets_stay_in_range() {
        assert_eq!(Direction::Previous.target(1), None);
        assert_eq!(Direction::Previous.target(3), Some(2));
        assert_eq!(Direction::Next.target(3), Some(4));
        assert_eq!(Direction::Next.target(i64::MAX), None);
        assert_eq!(Direction::parse("prev"), Some(Direction::Previous));
    }

    #[test]
    fn successor_resets_rev() -> Result<(), CoreError> {
        let base = VersionStamp { version_chain_id: "c".to_string(), version_num: 2, rev: 7 };
        assert_eq!(
            VersionStamp::successor_of(&base)?,
            VersionStamp { version_chain_id: "c".to_string(), version_num: 3, rev: 1 }
        );
        assert_eq!(VersionStamp::first("r1").version_chain_id, "r1");
        Ok(())
    }

    #[test]
    fn successor_of_the_last_version_number_is_rejected() {
        let base = VersionStamp { version_chain_id: "c".to_string(), version_num: i64::MAX, rev: 1 };
        let Err(err) = VersionStamp::successor_of(&base) else {
            panic!("i64::MAX has no successor");
        };
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn stamps_round_trip_through_rows() -> Result<(), CoreError> {
        let mut row = Row::new();
        row.insert("name".to_string(), json!("Kikuyu"));
        VersionStamp::first("l1").apply(&mut row);
        assert_eq!(VersionStamp::from_row(&row)?, VersionStamp::first("l1"));

        strip_version_fields(&mut row);
        assert_eq!(row.len(), 1);
        assert!(VersionStamp::from_row(&row).is_err());
        Ok(())
    }
}
