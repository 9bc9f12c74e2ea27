//! A byte-count value type that can be used directly as a command-line flag,
//! so size thresholds can be written as `20MB` or `1GB`. Units are powers of
//! 1000, matching how archive sizes are reported everywhere else.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteCount(pub u64);

pub const BYTE: ByteCount = ByteCount(1);
pub const KILOBYTE: ByteCount = ByteCount(1000);
pub const MEGABYTE: ByteCount = ByteCount(1000 * 1000);
pub const GIGABYTE: ByteCount = ByteCount(1000 * 1000 * 1000);

impl ByteCount {
    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Value-parser entry point for clap.
    pub fn parse(s: &str) -> Result<ByteCount, String> {
        ByteCount::from_str(s)
    }
}

impl FromStr for ByteCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        let suffix = &s[digits.len()..];
        if digits.is_empty() {
            return Err(format!("invalid size format: {s:?}"));
        }
        let quantity: u64 = digits
            .parse()
            .map_err(|e| format!("invalid size {s:?}: {e}"))?;
        let unit = match suffix {
            "" | "B" => BYTE,
            "K" | "KB" => KILOBYTE,
            "M" | "MB" => MEGABYTE,
            "G" | "GB" => GIGABYTE,
            _ => return Err(format!("invalid size format: {s:?}")),
        };
        Ok(ByteCount(quantity * unit.0))
    }
}

impl fmt::Display for ByteCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= GIGABYTE.0 && self.0 % GIGABYTE.0 == 0 {
            write!(f, "{}GB", self.0 / GIGABYTE.0)
        } else if self.0 >= MEGABYTE.0 && self.0 % MEGABYTE.0 == 0 {
            write!(f, "{}MB", self.0 / MEGABYTE.0)
        } else if self.0 >= KILOBYTE.0 && self.0 % KILOBYTE.0 == 0 {
            write!(f, "{}KB", self.0 / KILOBYTE.0)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}
