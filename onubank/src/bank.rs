//! Firmware bank identifiers.
//!
//! Devices carry two redundant firmware slots named "A" and "B". Management
//! protocols address them either by a single letter or by a numeric index
//! (0/1); both forms map losslessly onto [`BankId`]. Unknown identifiers are
//! rejected instead of falling back to bank A, since flashing the wrong slot
//! is not recoverable.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Identifier of one of the two firmware banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BankId {
    /// First bank, index 0.
    A,
    /// Second bank, index 1.
    B,
}

/// Errors from parsing a bank identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BankIdError {
    /// The letter is neither 'A' nor 'B'.
    #[error("invalid bank letter: {0:?}")]
    InvalidLetter(char),

    /// The index is neither 0 nor 1.
    #[error("invalid bank index: {0}")]
    InvalidIndex(u8),

    /// The name is not a single bank letter.
    #[error("invalid bank name: {0:?}")]
    InvalidName(String),
}

impl BankId {
    /// Single-letter form used in persisted variables and remote calls.
    pub fn letter(&self) -> char {
        match self {
            BankId::A => 'A',
            BankId::B => 'B',
        }
    }

    /// The letter as a string slice, for comparisons against stored values.
    pub fn as_str(&self) -> &'static str {
        match self {
            BankId::A => "A",
            BankId::B => "B",
        }
    }

    /// Numeric index used by the management protocol (0 for A, 1 for B).
    pub fn index(&self) -> u8 {
        match self {
            BankId::A => 0,
            BankId::B => 1,
        }
    }

    /// The opposite bank.
    pub fn other(&self) -> BankId {
        match self {
            BankId::A => BankId::B,
            BankId::B => BankId::A,
        }
    }
}

impl fmt::Display for BankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<char> for BankId {
    type Error = BankIdError;

    fn try_from(letter: char) -> Result<Self, Self::Error> {
        match letter {
            'A' | 'a' => Ok(BankId::A),
            'B' | 'b' => Ok(BankId::B),
            other => Err(BankIdError::InvalidLetter(other)),
        }
    }
}

impl TryFrom<u8> for BankId {
    type Error = BankIdError;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(BankId::A),
            1 => Ok(BankId::B),
            other => Err(BankIdError::InvalidIndex(other)),
        }
    }
}

impl FromStr for BankId {
    type Err = BankIdError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "A" | "a" => Ok(BankId::A),
            "B" | "b" => Ok(BankId::B),
            other => Err(BankIdError::InvalidName(other.to_string())),
        }
    }
}
