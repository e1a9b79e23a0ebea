//! Control channel records
//!
//! Lists exchanged with the driver start with an 8-byte header (a `u32`
//! length followed by 4 bytes of padding, so records stay 8-byte aligned)
//! and continue with an array of fixed-size records. Every field is little
//! endian.
//!
//! ```text
//! mapping: addr u64 | size u64 | level u32 | percpu u32            (24 bytes)
//! fault:   addr u64 | symbol [u8; 512] | count u32 | pad u32       (528 bytes)
//! run:     sequence u32 | run_error u32 | asi_active u32           (12 bytes)
//! ```

extern crate alloc;

use alloc::{string::String, vec, vec::Vec};

use crate::{
    asi::symbols::KSYM_SYMBOL_LEN,
    error::{KernelError, KernelResult},
};

/// Size of the header in front of every record list
pub const LIST_HEADER_SIZE: usize = 8;

fn user_buffer_error(len: usize) -> KernelError {
    KernelError::InvalidArgument {
        name: "user buffer",
        value: len as u64,
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Read the length field of a list
pub fn read_list_length(buf: &[u8]) -> KernelResult<u32> {
    if buf.len() < LIST_HEADER_SIZE {
        return Err(user_buffer_error(buf.len()));
    }
    Ok(read_u32(buf, 0))
}

/// Write the length field of a list
pub fn write_list_length(buf: &mut [u8], length: u32) -> KernelResult<()> {
    if buf.len() < LIST_HEADER_SIZE {
        return Err(user_buffer_error(buf.len()));
    }
    buf[0..4].copy_from_slice(&length.to_le_bytes());
    Ok(())
}

/// Byte range of record `index` in a list of `size`-byte records
fn record_range(buf_len: usize, size: usize, index: usize) -> KernelResult<core::ops::Range<usize>> {
    let start = LIST_HEADER_SIZE + index * size;
    let end = start + size;
    if end > buf_len {
        return Err(user_buffer_error(buf_len));
    }
    Ok(start..end)
}

/// A range to add to, remove from, or listed in a decorated page table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRecord {
    pub addr: u64,
    pub size: u64,
    /// Page-table level number (0 = PTE ... 4 = PGD)
    pub level: u32,
    pub percpu: bool,
}

impl MappingRecord {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.addr.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.level.to_le_bytes());
        bytes[20..24].copy_from_slice(&u32::from(self.percpu).to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(user_buffer_error(bytes.len()));
        }
        Ok(Self {
            addr: read_u64(bytes, 0),
            size: read_u64(bytes, 8),
            level: read_u32(bytes, 16),
            percpu: read_u32(bytes, 20) != 0,
        })
    }

    /// Read record `index` of a mapping list
    pub fn read_at(buf: &[u8], index: usize) -> KernelResult<Self> {
        let range = record_range(buf.len(), Self::SIZE, index)?;
        Self::from_bytes(&buf[range])
    }

    /// Write record `index` of a mapping list
    pub fn write_at(&self, buf: &mut [u8], index: usize) -> KernelResult<()> {
        let range = record_range(buf.len(), Self::SIZE, index)?;
        buf[range].copy_from_slice(&self.to_bytes());
        Ok(())
    }
}

/// A logged ASI fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    pub addr: u64,
    /// Formatted symbol of `addr`
    pub symbol: String,
    pub count: u32,
}

impl FaultRecord {
    pub const SIZE: usize = 8 + KSYM_SYMBOL_LEN + 4 + 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.addr.to_le_bytes());
        // NUL terminated
        let name = self.symbol.as_bytes();
        let len = name.len().min(KSYM_SYMBOL_LEN - 1);
        bytes[8..8 + len].copy_from_slice(&name[..len]);
        let count_at = 8 + KSYM_SYMBOL_LEN;
        bytes[count_at..count_at + 4].copy_from_slice(&self.count.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(user_buffer_error(bytes.len()));
        }
        let name = &bytes[8..8 + KSYM_SYMBOL_LEN];
        let len = name.iter().position(|&b| b == 0).unwrap_or(KSYM_SYMBOL_LEN);
        Ok(Self {
            addr: read_u64(bytes, 0),
            symbol: String::from_utf8_lossy(&name[..len]).into_owned(),
            count: read_u32(bytes, 8 + KSYM_SYMBOL_LEN),
        })
    }

    pub fn read_at(buf: &[u8], index: usize) -> KernelResult<Self> {
        let range = record_range(buf.len(), Self::SIZE, index)?;
        Self::from_bytes(&buf[range])
    }

    pub fn write_at(&self, buf: &mut [u8], index: usize) -> KernelResult<()> {
        let range = record_range(buf.len(), Self::SIZE, index)?;
        buf[range].copy_from_slice(&self.to_bytes());
        Ok(())
    }
}

/// Parameters and result of a sequence run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunParam {
    pub sequence: u32,
    pub run_error: u32,
    pub asi_active: bool,
}

impl RunParam {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.run_error.to_le_bytes());
        bytes[8..12].copy_from_slice(&u32::from(self.asi_active).to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(user_buffer_error(bytes.len()));
        }
        Ok(Self {
            sequence: read_u32(bytes, 0),
            run_error: read_u32(bytes, 4),
            asi_active: read_u32(bytes, 8) != 0,
        })
    }
}

// ===========================================================================
// Caller-side helpers
// ===========================================================================

/// Build a mapping list holding `mappings`
pub fn encode_mapping_list(mappings: &[MappingRecord]) -> Vec<u8> {
    let mut buf = mapping_list_buffer(mappings.len());
    buf[0..4].copy_from_slice(&(mappings.len() as u32).to_le_bytes());
    for (i, mapping) in mappings.iter().enumerate() {
        let start = LIST_HEADER_SIZE + i * MappingRecord::SIZE;
        buf[start..start + MappingRecord::SIZE].copy_from_slice(&mapping.to_bytes());
    }
    buf
}

/// Empty mapping list with room for `capacity` records
pub fn mapping_list_buffer(capacity: usize) -> Vec<u8> {
    let mut buf = vec![0u8; LIST_HEADER_SIZE + capacity * MappingRecord::SIZE];
    buf[0..4].copy_from_slice(&(capacity as u32).to_le_bytes());
    buf
}

/// Empty fault list with room for `capacity` records
pub fn fault_list_buffer(capacity: usize) -> Vec<u8> {
    let mut buf = vec![0u8; LIST_HEADER_SIZE + capacity * FaultRecord::SIZE];
    buf[0..4].copy_from_slice(&(capacity as u32).to_le_bytes());
    buf
}

/// Decode a mapping list returned by the driver.
///
/// Returns the total number of mappings and the records that fit.
pub fn decode_mapping_list(buf: &[u8]) -> KernelResult<(u32, Vec<MappingRecord>)> {
    let length = read_list_length(buf)?;
    let fits = (buf.len() - LIST_HEADER_SIZE) / MappingRecord::SIZE;
    let records = (0..fits.min(length as usize))
        .map(|i| MappingRecord::read_at(buf, i))
        .collect::<KernelResult<Vec<_>>>()?;
    Ok((length, records))
}

/// Decode a fault list returned by the driver.
///
/// Returns the total number of faults and the records that fit.
pub fn decode_fault_list(buf: &[u8]) -> KernelResult<(u32, Vec<FaultRecord>)> {
    let length = read_list_length(buf)?;
    let fits = (buf.len() - LIST_HEADER_SIZE) / FaultRecord::SIZE;
    let records = (0..fits.min(length as usize))
        .map(|i| FaultRecord::read_at(buf, i))
        .collect::<KernelResult<Vec<_>>>()?;
    Ok((length, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_record_layout() {
        let record = MappingRecord {
            addr: 0xffff_8880_0040_0000,
            size: 0x2000,
            level: 1,
            percpu: true,
        };
        let bytes = record.to_bytes();
        assert_eq!(&bytes[0..8], &0xffff_8880_0040_0000u64.to_le_bytes());
        assert_eq!(bytes[16], 1);
        assert_eq!(bytes[20], 1);
        assert_eq!(MappingRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_fault_record_symbol_is_terminated() {
        let record = FaultRecord {
            addr: 0x1000,
            symbol: "x".repeat(600),
            count: 3,
        };
        let bytes = record.to_bytes();
        assert_eq!(FaultRecord::SIZE, 528);
        assert_eq!(bytes[8 + KSYM_SYMBOL_LEN - 1], 0);
        let decoded = FaultRecord::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.symbol.len(), KSYM_SYMBOL_LEN - 1);
        assert_eq!(decoded.count, 3);
    }

    #[test]
    fn test_list_bounds() {
        let buf = encode_mapping_list(&[MappingRecord {
            addr: 0x1000,
            size: 0x1000,
            level: 0,
            percpu: false,
        }]);
        assert_eq!(buf.len(), LIST_HEADER_SIZE + MappingRecord::SIZE);
        assert_eq!(read_list_length(&buf).unwrap(), 1);
        assert!(MappingRecord::read_at(&buf, 0).is_ok());
        assert!(MappingRecord::read_at(&buf, 1).is_err());
        assert!(read_list_length(&buf[..4]).is_err());
    }

    #[test]
    fn test_run_param() {
        let param = RunParam {
            sequence: 3,
            run_error: 0,
            asi_active: true,
        };
        assert_eq!(RunParam::from_bytes(&param.to_bytes()).unwrap(), param);
        assert!(RunParam::from_bytes(&[0u8; 8]).is_err());
    }
}
