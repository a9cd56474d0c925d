//! On-media translation-table format.
//!
//! A translation-table page is a 4096-byte page holding a 16-byte header
//! followed by 1024 packed 3-byte records; the unused tail stays in the
//! erased state.
//!
//! # Header Layout (16 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       4   magic (0xEF87364A)
//!   4       4   logical_page_no (0 = master table)
//!   8       4   serial (generation counter)
//!  12       2   padding (0xFFFF)
//!  14       2   crc16 (CRC-16/1021 over bytes 0..14, padding forced to
//!               all-ones so the CRC is independent of its stored value)
//! ```
//!
//! # Record Layout (3 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   physical page number (0xFFFF = unallocated)
//!   2       1   sector-status bitmap (bit set = sector never written)
//! ```
//!
//! A record of all `0xFF` — the erased pattern — therefore decodes as
//! "unallocated, every sector blank", which is exactly what a fresh table
//! page must claim.

use crc::{Crc, CRC_16_IBM_3740};

use norftl_common::constants::{PAGE_INFO_SIZE, TT_HEADER_SIZE, TT_PAGE_MAGIC};
use norftl_common::PhysicalPageNo;

/// CRC-16 sealing table headers: poly 0x1021, init 0xFFFF, unreflected.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Parsed translation-table page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHeader {
    /// Identifies the page as a translation table.
    pub magic: u32,
    /// Logical table page number; 0 is the master table.
    pub logical_page_no: u32,
    /// Generation counter; among master candidates the greatest serial wins
    /// at mount.
    pub serial: u32,
    /// Stored header CRC.
    pub crc16: u16,
}

impl TableHeader {
    /// Builds a sealed header for a fresh table page.
    pub fn new(logical_page_no: u32, serial: u32) -> Self {
        let mut header = Self {
            magic: TT_PAGE_MAGIC,
            logical_page_no,
            serial,
            crc16: 0,
        };
        header.crc16 = header.expected_crc();
        header
    }

    /// Decodes the header from the first 16 bytes of a page image.
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            magic: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            logical_page_no: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            serial: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            crc16: u16::from_le_bytes(bytes[14..16].try_into().unwrap()),
        }
    }

    /// Encodes the header into the first 16 bytes of a page image.
    pub fn encode(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.logical_page_no.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.serial.to_le_bytes());
        bytes[12..14].copy_from_slice(&[0xFF, 0xFF]);
        bytes[14..16].copy_from_slice(&self.crc16.to_le_bytes());
    }

    /// The CRC the other fields imply, with the padding forced to all-ones.
    pub fn expected_crc(&self) -> u16 {
        let mut digest = CRC16.digest();
        digest.update(&self.magic.to_le_bytes());
        digest.update(&self.logical_page_no.to_le_bytes());
        digest.update(&self.serial.to_le_bytes());
        digest.update(&[0xFF, 0xFF]);
        digest.finalize()
    }

    /// Whether the magic and CRC identify a valid table page.
    pub fn is_valid(&self) -> bool {
        self.magic == TT_PAGE_MAGIC && self.crc16 == self.expected_crc()
    }
}

/// RAM form of one translation record: where a logical page lives and which
/// of its sectors hold written data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Physical location; `INVALID` while the logical page is unallocated.
    pub physical: PhysicalPageNo,
    /// One bit per sector; a set bit means the sector was never written and
    /// reads as all-ones.
    pub sector_status: u8,
}

impl PageInfo {
    /// The erased record pattern: unallocated, every sector blank.
    pub const UNALLOCATED: Self = Self {
        physical: PhysicalPageNo::INVALID,
        sector_status: 0xFF,
    };

    /// Decodes a 3-byte on-media record.
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            physical: PhysicalPageNo::new(u16::from_le_bytes(bytes[0..2].try_into().unwrap())),
            sector_status: bytes[2],
        }
    }

    /// Encodes the 3-byte on-media record.
    pub fn encode(&self, bytes: &mut [u8]) {
        bytes[0..2].copy_from_slice(&self.physical.as_u16().to_le_bytes());
        bytes[2] = self.sector_status;
    }

    /// Whether sector `sector_in_page` has never been written.
    #[inline]
    pub fn is_sector_blank(&self, sector_in_page: usize) -> bool {
        self.sector_status & (1 << sector_in_page) != 0
    }

    /// Marks sector `sector_in_page` as holding written data.
    #[inline]
    pub fn mark_sector_written(&mut self, sector_in_page: usize) {
        self.sector_status &= !(1 << sector_in_page);
    }
}

/// Reads record `record` from a table page image.
pub fn read_record(page: &[u8], record: usize) -> PageInfo {
    let offset = TT_HEADER_SIZE + record * PAGE_INFO_SIZE;
    PageInfo::decode(&page[offset..offset + PAGE_INFO_SIZE])
}

/// Writes record `record` into a table page image.
pub fn write_record(page: &mut [u8], record: usize, info: PageInfo) {
    let offset = TT_HEADER_SIZE + record * PAGE_INFO_SIZE;
    info.encode(&mut page[offset..offset + PAGE_INFO_SIZE]);
}

/// Bumps the serial of a table page image and reseals its CRC.
pub fn advance_serial(page: &mut [u8]) {
    let mut header = TableHeader::decode(page);
    header.serial = header.serial.wrapping_add(1);
    header.crc16 = header.expected_crc();
    header.encode(page);
}

/// Turns `page` into a fresh table page: every record unallocated, serial 1.
pub fn init_table_page(page: &mut [u8], logical_page_no: u32) {
    page.fill(0xFF);
    TableHeader::new(logical_page_no, 1).encode(page);
}

#[cfg(test)]
mod tests {
    use super::*;
    use norftl_common::constants::PAGE_SIZE;

    #[test]
    fn test_header_round_trip() {
        let header = TableHeader::new(3, 17);
        assert!(header.is_valid());

        let mut page = vec![0xFF; PAGE_SIZE];
        header.encode(&mut page);
        let decoded = TableHeader::decode(&page);
        assert_eq!(decoded, header);
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_crc_rejects_field_changes() {
        let mut page = vec![0xFF; PAGE_SIZE];
        TableHeader::new(0, 1).encode(&mut page);

        for byte in [0usize, 5, 9, 14] {
            let mut corrupt = page.clone();
            corrupt[byte] ^= 0x01;
            assert!(
                !TableHeader::decode(&corrupt).is_valid(),
                "flip in byte {byte} must invalidate the header"
            );
        }
    }

    #[test]
    fn test_crc_ignores_padding() {
        let mut page = vec![0xFF; PAGE_SIZE];
        TableHeader::new(0, 1).encode(&mut page);
        page[12] = 0x00;
        page[13] = 0xA5;
        assert!(TableHeader::decode(&page).is_valid());
    }

    #[test]
    fn test_erased_page_is_not_a_header() {
        let page = vec![0xFF; PAGE_SIZE];
        assert!(!TableHeader::decode(&page).is_valid());
    }

    #[test]
    fn test_record_round_trip() {
        let mut bytes = [0xFF; PAGE_INFO_SIZE];
        let info = PageInfo {
            physical: PhysicalPageNo::new(0x1234),
            sector_status: 0xFE,
        };
        info.encode(&mut bytes);
        assert_eq!(bytes, [0x34, 0x12, 0xFE]);
        assert_eq!(PageInfo::decode(&bytes), info);
    }

    #[test]
    fn test_erased_record_is_unallocated() {
        let info = PageInfo::decode(&[0xFF; PAGE_INFO_SIZE]);
        assert_eq!(info, PageInfo::UNALLOCATED);
        assert!(!info.physical.is_valid());
        for sector in 0..8 {
            assert!(info.is_sector_blank(sector));
        }
    }

    #[test]
    fn test_sector_status_bits() {
        let mut info = PageInfo::UNALLOCATED;
        info.mark_sector_written(0);
        info.mark_sector_written(7);
        assert!(!info.is_sector_blank(0));
        assert!(info.is_sector_blank(1));
        assert!(!info.is_sector_blank(7));
        assert_eq!(info.sector_status, 0x7E);
    }

    #[test]
    fn test_records_by_index() {
        let mut page = vec![0xFF; PAGE_SIZE];
        init_table_page(&mut page, 0);

        let info = PageInfo {
            physical: PhysicalPageNo::new(42),
            sector_status: 0x0F,
        };
        write_record(&mut page, 100, info);

        assert_eq!(read_record(&page, 100), info);
        assert_eq!(read_record(&page, 99), PageInfo::UNALLOCATED);
        assert_eq!(read_record(&page, 101), PageInfo::UNALLOCATED);
        assert_eq!(read_record(&page, 1023), PageInfo::UNALLOCATED);
    }

    #[test]
    fn test_fresh_table_page() {
        let mut page = vec![0x00; PAGE_SIZE];
        init_table_page(&mut page, 5);

        let header = TableHeader::decode(&page);
        assert!(header.is_valid());
        assert_eq!(header.logical_page_no, 5);
        assert_eq!(header.serial, 1);
        assert_eq!(read_record(&page, 0), PageInfo::UNALLOCATED);
        // tail beyond the record array stays erased
        assert!(page[TT_HEADER_SIZE + 1024 * PAGE_INFO_SIZE..]
            .iter()
            .all(|&b| b == 0xFF));
    }

    #[test]
    fn test_advance_serial_reseals() {
        let mut page = vec![0xFF; PAGE_SIZE];
        init_table_page(&mut page, 0);

        advance_serial(&mut page);
        let header = TableHeader::decode(&page);
        assert_eq!(header.serial, 2);
        assert!(header.is_valid());
    }
}
