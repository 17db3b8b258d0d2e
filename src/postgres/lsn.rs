use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A WAL position, stored as the 64-bit form the replication protocol uses
/// and displayed in the `XXXXXXXX/XXXXXXXX` text form Postgres reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Lsn {
    fn from(raw: u64) -> Self {
        Lsn(raw)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| Error::Protocol(format!("Invalid LSN: {s}")))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| Error::Protocol(format!("Invalid LSN: {s}")))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| Error::Protocol(format!("Invalid LSN: {s}")))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}
