//! The bet record and the predicate that decides which bets win the draw.

use std::fmt;

use time::{Date, format_description::BorrowedFormatItem, macros::format_description};

use crate::message::DecodeError;

const FIELD_DELIMITER: char = ',';
const FIELDS_PER_RECORD: usize = 6;
const BIRTHDATE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Number drawn by the lottery unless configured otherwise.
pub const DEFAULT_WINNING_NUMBER: u32 = 7574;

/// A single wager submitted by an agency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: u32,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: Date,
    pub number: u32,
}

impl Bet {
    /// Parses one `agency,firstName,lastName,document,birthdate,number` record.
    ///
    /// Trailing whitespace after the record is ignored, so records that end
    /// in a newline before the next `|` still parse. Fields are kept verbatim
    /// and may not contain control characters.
    pub fn parse_record(record: &str) -> Result<Self, DecodeError> {
        let fields: Vec<&str> = record.trim_end().split(FIELD_DELIMITER).collect();
        let [agency, first_name, last_name, document, birthdate, number] = fields[..] else {
            return Err(DecodeError::FieldCount {
                found: fields.len(),
                expected: FIELDS_PER_RECORD,
            });
        };

        for (field, value) in [("first name", first_name), ("last name", last_name)] {
            if value.chars().any(char::is_control) {
                return Err(DecodeError::ControlCharacter { field });
            }
        }

        let agency = parse_integer("agency", agency)?;
        if agency == 0 {
            return Err(DecodeError::NonPositiveAgency);
        }

        if document.is_empty() || !document.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(DecodeError::InvalidDocument {
                value: document.to_string(),
            });
        }

        let birthdate =
            Date::parse(birthdate, BIRTHDATE_FORMAT).map_err(|_| DecodeError::InvalidDate {
                value: birthdate.to_string(),
            })?;

        Ok(Self {
            agency,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document: document.to_string(),
            birthdate,
            number: parse_integer("number", number)?,
        })
    }
}

pub(crate) fn parse_integer(field: &'static str, value: &str) -> Result<u32, DecodeError> {
    value.parse().map_err(|_| DecodeError::InvalidInteger {
        field,
        value: value.to_string(),
    })
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let birthdate = self
            .birthdate
            .format(BIRTHDATE_FORMAT)
            .map_err(|_| fmt::Error)?;
        write!(
            f,
            "{},{},{},{},{},{}",
            self.agency, self.first_name, self.last_name, self.document, birthdate, self.number
        )
    }
}

/// Decides whether a stored bet is a winner of the draw.
///
/// Implementations must be pure: the draw evaluates every bet exactly once
/// and caches the outcome for the rest of the server's lifetime.
pub trait WinPredicate: Send + Sync {
    fn is_winner(&self, bet: &Bet) -> bool;
}

impl<F> WinPredicate for F
where
    F: Fn(&Bet) -> bool + Send + Sync,
{
    fn is_winner(&self, bet: &Bet) -> bool {
        self(bet)
    }
}

/// A bet wins when it wagered exactly this number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinningNumber(pub u32);

impl Default for WinningNumber {
    fn default() -> Self {
        Self(DEFAULT_WINNING_NUMBER)
    }
}

impl WinPredicate for WinningNumber {
    fn is_winner(&self, bet: &Bet) -> bool {
        bet.number == self.0
    }
}
