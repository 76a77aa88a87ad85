//! Tuning-file (setfile) header parsing.
//!
//! A setfile is one blob holding tuning sets for several blocks. Its header
//! is little-endian and comes in two layouts, told apart by the leading
//! magic:
//!
//! ```text
//! V2: magic hw_count
//!     { hw_id scenario_count setfile_count
//!       scenario_index[scenario_count] (offset size)[setfile_count] }*
//! V3: magic header_size version hw_count
//!     { hw_id subversion scenario_count setfile_count
//!       scenario_index[scenario_count] (offset size)[setfile_count] }*
//! ```
//!
//! V2 offsets count from the start of the blob; V3 offsets count from
//! `header_size`. Every tuning set must lie inside the blob.

use crate::error::SetfileError;
use crate::hw::HwIpId;
use bytes::Buf;

/// Magic of the V2 layout (`"VFS "`).
pub const SETFILE_V2_MAGIC: u32 = 0x2053_4656;
/// Magic of the V3 layout (`"VFS3"`).
pub const SETFILE_V3_MAGIC: u32 = 0x3353_4656;

/// Header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetfileVersion {
    /// Flat layout
    V2,
    /// Layout with explicit header size
    V3 {
        /// Version field from the header
        version: u32,
    },
}

/// One tuning set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetfileEntry {
    /// Position in the block's table
    pub index: usize,
    /// Absolute address (blob base + offset)
    pub addr: u64,
    /// Size in bytes
    pub size: u32,
}

/// Tuning tables for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetfileTable {
    /// Block the table belongs to
    pub hw: HwIpId,
    /// V3 subversion, zero for V2
    pub subversion: u32,
    /// Scenario → tuning set index
    pub scenarios: Vec<u32>,
    /// Tuning sets
    pub entries: Vec<SetfileEntry>,
}

impl SetfileTable {
    /// Tuning set used for `scenario`.
    #[must_use]
    pub fn resolve(&self, scenario: u32) -> Option<&SetfileEntry> {
        let index = *self.scenarios.get(scenario as usize)?;
        self.entries.get(index as usize)
    }
}

/// Parsed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSetfile {
    /// Layout found
    pub version: SetfileVersion,
    /// Per-block tables, in header order
    pub tables: Vec<SetfileTable>,
}

impl ParsedSetfile {
    /// Table for `hw`.
    #[must_use]
    pub fn table(&self, hw: HwIpId) -> Option<&SetfileTable> {
        self.tables.iter().find(|t| t.hw == hw)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    len: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            len: buf.len(),
        }
    }

    fn pos(&self) -> usize {
        self.len - self.buf.remaining()
    }

    fn need(&self, bytes: usize) -> Result<(), SetfileError> {
        let have = self.buf.remaining();
        if have < bytes {
            return Err(SetfileError::Truncated {
                at: self.pos(),
                need: bytes - have,
            });
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, SetfileError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u32s(&mut self, count: u32) -> Result<Vec<u32>, SetfileError> {
        self.need((count as usize).saturating_mul(4))?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }
}

/// Parse the header of `buf`, which is mapped at `base_addr`.
pub fn parse(buf: &[u8], base_addr: u64) -> Result<ParsedSetfile, SetfileError> {
    let mut rd = Reader::new(buf);
    let magic = rd.u32()?;

    let (version, data_base, hw_count) = match magic {
        SETFILE_V2_MAGIC => (SetfileVersion::V2, 0usize, rd.u32()?),
        SETFILE_V3_MAGIC => {
            let header_size = rd.u32()? as usize;
            let version = rd.u32()?;
            let hw_count = rd.u32()?;
            if header_size > buf.len() {
                return Err(SetfileError::Truncated {
                    at: buf.len(),
                    need: header_size - buf.len(),
                });
            }
            (SetfileVersion::V3 { version }, header_size, hw_count)
        }
        other => return Err(SetfileError::BadMagic { magic: other }),
    };

    let mut tables = Vec::new();
    for _ in 0..hw_count {
        let hw_id = rd.u32()?;
        let subversion = match version {
            SetfileVersion::V2 => 0,
            SetfileVersion::V3 { .. } => rd.u32()?,
        };
        let scenario_count = rd.u32()?;
        let setfile_count = rd.u32()?;
        let scenarios = rd.u32s(scenario_count)?;
        let pairs = rd.u32s(setfile_count.saturating_mul(2))?;

        let hw = HwIpId::from_raw(hw_id).ok_or(SetfileError::UnknownHwIp { hw_id })?;
        let entries = pairs
            .chunks_exact(2)
            .enumerate()
            .map(|(index, pair)| {
                let (offset, size) = (pair[0], pair[1]);
                let start = data_base + offset as usize;
                if start.saturating_add(size as usize) > buf.len() {
                    return Err(SetfileError::OutOfBounds {
                        hw_id,
                        index,
                        offset,
                        size,
                        len: buf.len(),
                    });
                }
                Ok(SetfileEntry {
                    index,
                    addr: base_addr + start as u64,
                    size,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tables.push(SetfileTable {
            hw,
            subversion,
            scenarios,
            entries,
        });
    }

    Ok(ParsedSetfile { version, tables })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn v2_blob() -> Vec<u8> {
        let mut b = Vec::new();
        b.put_u32_le(SETFILE_V2_MAGIC);
        b.put_u32_le(1);
        // ISP0: 3 scenarios over 2 tuning sets
        b.put_u32_le(4);
        b.put_u32_le(3);
        b.put_u32_le(2);
        for idx in [0, 1, 1] {
            b.put_u32_le(idx);
        }
        b.put_u32_le(64);
        b.put_u32_le(16);
        b.put_u32_le(80);
        b.put_u32_le(32);
        b.resize(112, 0xAA);
        b
    }

    #[test]
    fn test_parse_v2() {
        let parsed = parse(&v2_blob(), 0x1000_0000).unwrap();
        assert_eq!(parsed.version, SetfileVersion::V2);
        let table = parsed.table(HwIpId::Isp0).unwrap();
        assert_eq!(table.scenarios, vec![0, 1, 1]);

        let entry = table.resolve(2).unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.addr, 0x1000_0000 + 80);
        assert_eq!(entry.size, 32);
        assert!(table.resolve(3).is_none());
    }

    #[test]
    fn test_parse_v3_offsets_from_header_size() {
        let mut b = Vec::new();
        b.put_u32_le(SETFILE_V3_MAGIC);
        b.put_u32_le(48);
        b.put_u32_le(3);
        b.put_u32_le(1);
        // 3AA0, subversion 7, 1 scenario, 1 tuning set
        b.put_u32_le(2);
        b.put_u32_le(7);
        b.put_u32_le(1);
        b.put_u32_le(1);
        b.put_u32_le(0);
        b.put_u32_le(8);
        b.put_u32_le(16);
        b.resize(72, 0);

        let parsed = parse(&b, 0x2000).unwrap();
        assert_eq!(parsed.version, SetfileVersion::V3 { version: 3 });
        let table = parsed.table(HwIpId::Taa0).unwrap();
        assert_eq!(table.subversion, 7);
        assert_eq!(table.resolve(0).unwrap().addr, 0x2000 + 48 + 8);
    }

    #[test]
    fn test_bad_magic() {
        let mut b = Vec::new();
        b.put_u32_le(0xDEAD_BEEF);
        assert_eq!(
            parse(&b, 0),
            Err(SetfileError::BadMagic { magic: 0xDEAD_BEEF })
        );
    }

    #[test]
    fn test_truncated_header() {
        let blob = v2_blob();
        let err = parse(&blob[..18], 0).unwrap_err();
        assert!(matches!(err, SetfileError::Truncated { at: 16, .. }));
    }

    #[test]
    fn test_entry_out_of_bounds() {
        let mut blob = v2_blob();
        blob.truncate(100);
        let err = parse(&blob, 0).unwrap_err();
        assert!(matches!(err, SetfileError::OutOfBounds { index: 1, .. }));
    }

    #[test]
    fn test_unknown_hw() {
        let mut b = Vec::new();
        b.put_u32_le(SETFILE_V2_MAGIC);
        b.put_u32_le(1);
        b.put_u32_le(77);
        b.put_u32_le(0);
        b.put_u32_le(0);
        assert_eq!(parse(&b, 0), Err(SetfileError::UnknownHwIp { hw_id: 77 }));
    }
}
