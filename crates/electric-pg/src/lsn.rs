//! WAL positions in PostgreSQL's `X/Y` text form

use crate::error::{PgError, PgResult};

/// Parse `16/B374D848` into a 64-bit LSN
pub fn parse_lsn(text: &str) -> PgResult<u64> {
    let invalid = || PgError::Protocol(format!("invalid LSN: {text:?}"));
    let (hi, lo) = text.trim().split_once('/').ok_or_else(invalid)?;
    let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

/// Render an LSN as `X/Y`
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn as u32)
}
