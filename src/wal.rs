//! Reader for SQLite write-ahead log files
//!
//! Only the committed prefix of a WAL is ever captured by a backup. A frame
//! counts when its salts match the header and its cumulative checksum holds;
//! the prefix ends after the last valid commit frame (non-zero db size).

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::constants::{WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC_BE, WAL_MAGIC_LE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Checksum words are big-endian (magic `0x377f0683`)
    pub big_endian: bool,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt: [u32; 2],
    pub checksum: [u32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalScan {
    /// `None` for a missing, empty or unreadable WAL
    pub header: Option<WalHeader>,
    /// Byte offset just past the last valid commit frame, 0 when there is none
    pub committed_end: u64,
    /// Frames inside the committed prefix
    pub committed_frames: u64,
}

impl WalScan {
    pub fn salt(&self) -> Option<[u32; 2]> {
        self.header.map(|h| h.salt)
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// SQLite's WAL checksum over `data` (length a multiple of 8), seeded with `seed`
pub fn checksum(data: &[u8], big_endian: bool, seed: [u32; 2]) -> [u32; 2] {
    let [mut s0, mut s1] = seed;
    for pair in data.chunks_exact(8) {
        let (x0, x1) = if big_endian {
            (be_u32(&pair[0..4]), be_u32(&pair[4..8]))
        } else {
            (
                u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]),
                u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]),
            )
        };
        s0 = s0.wrapping_add(x0).wrapping_add(s1);
        s1 = s1.wrapping_add(x1).wrapping_add(s0);
    }
    [s0, s1]
}

/// Parse and validate the 32-byte WAL header
pub fn parse_header(buf: &[u8]) -> Option<WalHeader> {
    if buf.len() < WAL_HEADER_SIZE as usize {
        return None;
    }
    let magic = be_u32(&buf[0..4]);
    let big_endian = match magic {
        WAL_MAGIC_LE => false,
        WAL_MAGIC_BE => true,
        _ => return None,
    };
    let page_size = be_u32(&buf[8..12]);
    if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
        return None;
    }
    let stored = [be_u32(&buf[24..28]), be_u32(&buf[28..32])];
    if checksum(&buf[..24], big_endian, [0, 0]) != stored {
        return None;
    }
    Some(WalHeader {
        big_endian,
        page_size,
        checkpoint_seq: be_u32(&buf[12..16]),
        salt: [be_u32(&buf[16..20]), be_u32(&buf[20..24])],
        checksum: stored,
    })
}

/// Scan a WAL from any reader, frame by frame
pub fn scan<R: Read>(mut reader: R) -> io::Result<WalScan> {
    let mut header_buf = [0u8; WAL_HEADER_SIZE as usize];
    if !read_full(&mut reader, &mut header_buf)? {
        return Ok(WalScan::default());
    }
    let Some(header) = parse_header(&header_buf) else {
        return Ok(WalScan::default());
    };

    let frame_size = WAL_FRAME_HEADER_SIZE as usize + header.page_size as usize;
    let mut frame = vec![0u8; frame_size];
    let mut running = header.checksum;
    let mut offset = WAL_HEADER_SIZE;
    let mut frames = 0u64;
    let mut result = WalScan {
        header: Some(header),
        committed_end: 0,
        committed_frames: 0,
    };

    while read_full(&mut reader, &mut frame)? {
        let page_no = be_u32(&frame[0..4]);
        let db_size = be_u32(&frame[4..8]);
        let salt = [be_u32(&frame[8..12]), be_u32(&frame[12..16])];
        let stored = [be_u32(&frame[16..20]), be_u32(&frame[20..24])];

        if page_no == 0 || salt != header.salt {
            break;
        }
        let seed = checksum(&frame[..8], header.big_endian, running);
        let computed = checksum(&frame[WAL_FRAME_HEADER_SIZE as usize..], header.big_endian, seed);
        if computed != stored {
            break;
        }

        running = computed;
        offset += frame_size as u64;
        frames += 1;
        if db_size != 0 {
            result.committed_end = offset;
            result.committed_frames = frames;
        }
    }

    Ok(result)
}

/// Scan the WAL file at `path`; a missing file scans as empty
pub fn scan_file(path: &Path) -> io::Result<WalScan> {
    match File::open(path) {
        Ok(file) => scan(BufReader::with_capacity(256 * 1024, file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(WalScan::default()),
        Err(e) => Err(e),
    }
}

/// Read exactly `buf.len()` bytes; `false` on a clean or short end of input
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const PAGE: u32 = 512;

    /// Build a WAL image; each tuple is (page number, db size after commit or 0)
    pub(crate) fn build_wal(big_endian: bool, salt: [u32; 2], frames: &[(u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        let magic = if big_endian { WAL_MAGIC_BE } else { WAL_MAGIC_LE };
        out.extend_from_slice(&magic.to_be_bytes());
        out.extend_from_slice(&3_007_000u32.to_be_bytes());
        out.extend_from_slice(&PAGE.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&salt[0].to_be_bytes());
        out.extend_from_slice(&salt[1].to_be_bytes());
        let mut running = checksum(&out, big_endian, [0, 0]);
        out.extend_from_slice(&running[0].to_be_bytes());
        out.extend_from_slice(&running[1].to_be_bytes());

        for (i, (page_no, db_size)) in frames.iter().enumerate() {
            let mut head = Vec::new();
            head.extend_from_slice(&page_no.to_be_bytes());
            head.extend_from_slice(&db_size.to_be_bytes());
            let page = vec![(i % 251) as u8; PAGE as usize];
            running = checksum(&head, big_endian, running);
            running = checksum(&page, big_endian, running);
            head.extend_from_slice(&salt[0].to_be_bytes());
            head.extend_from_slice(&salt[1].to_be_bytes());
            head.extend_from_slice(&running[0].to_be_bytes());
            head.extend_from_slice(&running[1].to_be_bytes());
            out.extend_from_slice(&head);
            out.extend_from_slice(&page);
        }
        out
    }

    fn frame_end(n: u64) -> u64 {
        WAL_HEADER_SIZE + n * (WAL_FRAME_HEADER_SIZE + PAGE as u64)
    }

    #[test]
    fn test_empty_input() {
        let scan = scan(io::empty()).unwrap();
        assert!(scan.header.is_none());
        assert_eq!(scan.committed_end, 0);
    }

    #[test]
    fn test_committed_prefix_excludes_open_transaction() {
        // Two transactions, then two frames of a third one without a commit
        let wal = build_wal(false, [7, 9], &[(1, 0), (2, 2), (3, 3), (4, 0), (5, 0)]);
        let scan = scan(&wal[..]).unwrap();

        assert_eq!(scan.salt(), Some([7, 9]));
        assert_eq!(scan.committed_frames, 3);
        assert_eq!(scan.committed_end, frame_end(3));
    }

    #[test]
    fn test_big_endian_checksums() {
        let wal = build_wal(true, [1, 2], &[(1, 1)]);
        let scan = scan(&wal[..]).unwrap();
        assert!(scan.header.unwrap().big_endian);
        assert_eq!(scan.committed_end, frame_end(1));
    }

    #[test]
    fn test_truncated_frame_is_ignored() {
        let wal = build_wal(false, [3, 4], &[(1, 1), (2, 2)]);
        let cut = &wal[..wal.len() - 100];
        let scan = scan(cut).unwrap();
        assert_eq!(scan.committed_end, frame_end(1));
    }

    #[test]
    fn test_corrupt_checksum_stops_scan() {
        let mut wal = build_wal(false, [3, 4], &[(1, 1), (2, 2), (3, 3)]);
        let second_page = (frame_end(1) + WAL_FRAME_HEADER_SIZE + 10) as usize;
        wal[second_page] ^= 0xff;

        let scan = scan(&wal[..]).unwrap();
        assert_eq!(scan.committed_frames, 1);
        assert_eq!(scan.committed_end, frame_end(1));
    }

    #[test]
    fn test_stale_frames_after_restart_are_ignored() {
        // A restarted WAL keeps old frames with the previous salt after the new ones
        let mut wal = build_wal(false, [10, 11], &[(1, 1)]);
        let old = build_wal(false, [5, 6], &[(1, 0), (2, 2), (3, 3)]);
        wal.extend_from_slice(&old[frame_end(1) as usize..]);

        let scan = scan(&wal[..]).unwrap();
        assert_eq!(scan.committed_end, frame_end(1));
    }

    #[test]
    fn test_bad_header_checksum_scans_as_empty() {
        let mut wal = build_wal(false, [1, 1], &[(1, 1)]);
        wal[17] ^= 0x01;
        let scan = scan(&wal[..]).unwrap();
        assert!(scan.header.is_none());
        assert_eq!(scan.committed_end, 0);
    }
}
