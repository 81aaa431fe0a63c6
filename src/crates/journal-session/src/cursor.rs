//! Serializable positions within a set of journal files.
//!
//! A cursor names an entry by everything needed to find it again after
//! the file holding it was rotated: its sequence number lineage and
//! number, its boot and monotonic time, its wall clock time and the XOR
//! hash of its fields. The textual form is
//! `s=<lineage>;i=<seqnum>;b=<boot>;m=<monotonic>;t=<realtime>;x=<xor hash>`
//! with ids as 32 hex digits and numbers in hex.

use crate::SessionError;
use journal_common::id128;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Position of an entry, complete when it was read from a file and
/// possibly partial when parsed or built for a seek.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    /// Sequence number lineage and sequence number
    pub seqnum: Option<(Uuid, u64)>,
    /// Boot id and monotonic time within that boot
    pub monotonic: Option<(Uuid, u64)>,
    pub realtime: Option<u64>,
    pub xor_hash: Option<u64>,
}

impl Cursor {
    pub fn at_realtime(realtime: u64) -> Self {
        Self {
            realtime: Some(realtime),
            ..Default::default()
        }
    }

    pub fn at_monotonic(boot_id: Uuid, monotonic: u64) -> Self {
        Self {
            monotonic: Some((boot_id, monotonic)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Orders two positions the way entries are interleaved across files.
    ///
    /// Sequence numbers decide within one lineage and monotonic time within
    /// one boot. Entries without either in common fall back to wall clock
    /// time and then to the XOR hash. Fields missing on either side are
    /// skipped, so positions that agree on all shared fields are equal.
    pub fn compare(&self, other: &Cursor) -> Ordering {
        if let (Some((a_id, a)), Some((b_id, b))) = (self.seqnum, other.seqnum) {
            if a_id == b_id && a != b {
                return a.cmp(&b);
            }
        }

        if let (Some((a_boot, a)), Some((b_boot, b))) = (self.monotonic, other.monotonic) {
            if a_boot == b_boot && a != b {
                return a.cmp(&b);
            }
        }

        if let (Some(a), Some(b)) = (self.realtime, other.realtime) {
            if a != b {
                return a.cmp(&b);
            }
        }

        match (self.xor_hash, other.xor_hash) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(6);
        if let Some((seqnum_id, seqnum)) = self.seqnum {
            parts.push(format!("s={}", id128::to_hex(&seqnum_id)));
            parts.push(format!("i={seqnum:x}"));
        }
        if let Some((boot_id, monotonic)) = self.monotonic {
            parts.push(format!("b={}", id128::to_hex(&boot_id)));
            parts.push(format!("m={monotonic:x}"));
        }
        if let Some(realtime) = self.realtime {
            parts.push(format!("t={realtime:x}"));
        }
        if let Some(xor_hash) = self.xor_hash {
            parts.push(format!("x={xor_hash:x}"));
        }
        f.write_str(&parts.join(";"))
    }
}

impl FromStr for Cursor {
    type Err = SessionError;

    /// Parses the textual form. Unknown keys are skipped; a lineage or
    /// boot id without its number is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidCursor(s.to_string());
        let number = |v: &str| u64::from_str_radix(v, 16).map_err(|_| invalid());
        let id = |v: &str| id128::parse(v).map_err(|_| invalid());

        let mut seqnum_id = None;
        let mut seqnum = None;
        let mut boot_id = None;
        let mut monotonic = None;
        let mut cursor = Cursor::default();

        for part in s.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(invalid)?;
            match key {
                "s" => seqnum_id = Some(id(value)?),
                "i" => seqnum = Some(number(value)?),
                "b" => boot_id = Some(id(value)?),
                "m" => monotonic = Some(number(value)?),
                "t" => cursor.realtime = Some(number(value)?),
                "x" => cursor.xor_hash = Some(number(value)?),
                _ => {}
            }
        }

        cursor.seqnum = seqnum_id.zip(seqnum);
        cursor.monotonic = boot_id.zip(monotonic);

        if cursor.is_empty() {
            return Err(invalid());
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> Cursor {
        Cursor {
            seqnum: Some((Uuid::from_u128(0xabc), 0x10)),
            monotonic: Some((Uuid::from_u128(0xdef), 0x2000)),
            realtime: Some(0x5f5e100),
            xor_hash: Some(0xdeadbeef),
        }
    }

    #[test]
    fn text_form() {
        assert_eq!(
            full().to_string(),
            "s=00000000000000000000000000000abc;i=10;\
             b=00000000000000000000000000000def;m=2000;t=5f5e100;x=deadbeef"
        );
        assert_eq!(full().to_string().parse::<Cursor>().unwrap(), full());
    }

    #[test]
    fn partial_and_unknown_fields() {
        let cursor: Cursor = "t=10;z=whatever".parse().unwrap();
        assert_eq!(cursor, Cursor::at_realtime(16));

        // A lineage without a sequence number is of no use
        let cursor: Cursor = "s=00000000000000000000000000000abc;t=1".parse().unwrap();
        assert_eq!(cursor.seqnum, None);
    }

    #[test]
    fn malformed_cursors_are_rejected() {
        for text in ["", "garbage", "t=xyz", "s=123;i=1", "z=1"] {
            assert!(text.parse::<Cursor>().is_err(), "{text:?} parsed");
        }
    }

    #[test]
    fn lineage_decides_before_time() {
        let a = full();
        let mut b = full();
        b.seqnum = Some((Uuid::from_u128(0xabc), 0x11));
        b.realtime = Some(1);
        assert_eq!(a.compare(&b), Ordering::Less);

        // Other lineage and boot: wall clock time decides
        b.seqnum = Some((Uuid::from_u128(0x1), 0x1));
        b.monotonic = Some((Uuid::from_u128(0x2), 0x1));
        assert_eq!(a.compare(&b), Ordering::Greater);
    }

    #[test]
    fn partial_positions_compare_on_shared_fields() {
        assert_eq!(full().compare(&Cursor::at_realtime(0x5f5e100)), Ordering::Equal);
        assert_eq!(full().compare(&Cursor::at_realtime(0x5f5e101)), Ordering::Less);
        assert_eq!(
            full().compare(&Cursor::at_monotonic(Uuid::from_u128(0xdef), 0x1000)),
            Ordering::Greater
        );
    }
}
