use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed number a wager must match to win the draw.
pub const WINNING_NUMBER: u32 = 7574;

/// Separator between the six fields of a bet-string on the wire.
pub const FIELD_SEPARATOR: char = ';';

/// Strict calendar format for birthdates.
pub const BIRTHDATE_FORMAT: &str = "%Y-%m-%d";

const FIELD_COUNT: usize = 6;

/// One wagering record submitted by an agency.
///
/// Field order is the wire order and the durable-log column order; the
/// `document` is compared as text so identifiers keep their leading zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub agency: u32,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: NaiveDate,
    pub number: u32,
}

#[derive(Debug, Error)]
pub enum BetParseError {
    #[error("expected {FIELD_COUNT} fields, got {0}")]
    FieldCount(usize),
    #[error("agency must be a positive integer, got {0:?}")]
    Agency(String),
    #[error("birthdate must be a valid YYYY-MM-DD date, got {0:?}")]
    Birthdate(String),
    #[error("wager number must be an integer, got {0:?}")]
    Number(String),
}

impl Bet {
    /// Encodes the six fields as one `;`-separated bet-string.
    ///
    /// No escaping is performed; a field containing a separator or a line
    /// break cannot be transported and surfaces on the peer as a
    /// field-count error.
    pub fn encode(&self) -> String {
        format!(
            "{1}{0}{2}{0}{3}{0}{4}{0}{5}{0}{6}",
            FIELD_SEPARATOR,
            self.agency,
            self.first_name,
            self.last_name,
            self.document,
            self.birthdate.format(BIRTHDATE_FORMAT),
            self.number,
        )
    }

    /// Parses one bet-string. Fields are trimmed of surrounding whitespace;
    /// every field must be present and well typed before the record is
    /// accepted anywhere.
    pub fn decode(input: &str) -> Result<Self, BetParseError> {
        let fields: Vec<&str> = input.split(FIELD_SEPARATOR).map(str::trim).collect();
        if fields.len() != FIELD_COUNT {
            return Err(BetParseError::FieldCount(fields.len()));
        }

        let agency: u32 = fields[0]
            .parse()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| BetParseError::Agency(fields[0].to_string()))?;
        let birthdate = NaiveDate::parse_from_str(fields[4], BIRTHDATE_FORMAT)
            .map_err(|_| BetParseError::Birthdate(fields[4].to_string()))?;
        let number: u32 = fields[5]
            .parse()
            .map_err(|_| BetParseError::Number(fields[5].to_string()))?;

        Ok(Self {
            agency,
            first_name: fields[1].to_string(),
            last_name: fields[2].to_string(),
            document: fields[3].to_string(),
            birthdate,
            number,
        })
    }

    pub fn is_winner(&self) -> bool {
        self.number == WINNING_NUMBER
    }
}
