//! Mutation journal
//!
//! An append-only redo log of table mutations. Every change to the
//! in-memory tables is appended here before it is applied; opening a
//! database replays the journal from the start.
//!
//! ## Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Header (12 bytes)                                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Magic: "TEMPOJNL" (8 bytes)                                     │
//! │ Version: u16 (2 bytes, LE)                                      │
//! │ Reserved: u16 (2 bytes)                                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ For each record:                                                │
//! │   Length: u32 (4 bytes, LE)                                     │
//! │   Data: [u8; length] (msgpack-serialized Mutation)              │
//! │   CRC32: u32 (4 bytes, LE) over Data                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Torn tails
//!
//! A crash mid-append leaves a partial or corrupt record at the end of the
//! file. Replay stops at the first record that does not parse or whose
//! checksum does not match, truncates the file there and logs a warning.
//! Everything before that point is intact.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tempo_core::{Mutation, TempoError, TempoResult};
use tracing::{debug, info, warn};

use crate::mode::DurabilityMode;

/// File magic
pub const JOURNAL_MAGIC: &[u8; 8] = b"TEMPOJNL";
/// Current format version
pub const JOURNAL_VERSION: u16 = 1;
/// Header size in bytes: magic (8) + version (2) + reserved (2)
pub const HEADER_SIZE: usize = 12;
/// Per-record framing overhead: length (4) + crc (4)
const FRAME_OVERHEAD: usize = 8;

// =============================================================================
// Encoding
// =============================================================================

/// Frame one mutation as `len | msgpack | crc32`
pub fn encode_record(mutation: &Mutation) -> TempoResult<Vec<u8>> {
    let payload = rmp_serde::to_vec(mutation)
        .map_err(|e| TempoError::serialization(format!("msgpack encode mutation: {}", e)))?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.write_u32::<LittleEndian>(payload.len() as u32)?;
    frame.extend_from_slice(&payload);
    frame.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
    Ok(frame)
}

fn encode_header() -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(JOURNAL_MAGIC);
    header.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    header.extend_from_slice(&[0u8; 2]);
    header
}

/// Result of decoding a journal body
#[derive(Debug, Default)]
pub struct DecodedRecords {
    /// Mutations of every intact record, in order
    pub mutations: Vec<Mutation>,
    /// Byte length of the intact prefix (relative to the body start)
    pub valid_len: usize,
    /// Why decoding stopped early, if it did
    pub torn: Option<String>,
}

/// Decode records until the end of `body` or the first damaged record
pub fn decode_records(body: &[u8]) -> DecodedRecords {
    let mut decoded = DecodedRecords::default();
    let mut cursor = Cursor::new(body);
    loop {
        let start = cursor.position() as usize;
        if start == body.len() {
            break;
        }
        let len = match cursor.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(_) => {
                decoded.torn = Some(format!("partial length prefix at offset {}", start));
                break;
            }
        };
        let payload_start = start + 4;
        let payload_end = payload_start.saturating_add(len);
        if payload_end.saturating_add(4) > body.len() {
            decoded.torn = Some(format!("record at offset {} extends past end of file", start));
            break;
        }
        let payload = &body[payload_start..payload_end];
        cursor.set_position(payload_end as u64);
        let stored_crc = match cursor.read_u32::<LittleEndian>() {
            Ok(crc) => crc,
            Err(_) => {
                decoded.torn = Some(format!("partial checksum at offset {}", payload_end));
                break;
            }
        };
        if crc32fast::hash(payload) != stored_crc {
            decoded.torn = Some(format!("checksum mismatch at offset {}", start));
            break;
        }
        match rmp_serde::from_slice::<Mutation>(payload) {
            Ok(mutation) => decoded.mutations.push(mutation),
            Err(e) => {
                decoded.torn = Some(format!("undecodable record at offset {}: {}", start, e));
                break;
            }
        }
        decoded.valid_len = payload_end + 4;
    }
    decoded
}

// =============================================================================
// Journal
// =============================================================================

/// Summary of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Number of records replayed
    pub records: usize,
    /// Bytes cut from the end of the file
    pub truncated_bytes: u64,
}

/// Append-only mutation journal backed by one file
pub struct Journal {
    path: PathBuf,
    mode: DurabilityMode,
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Open (or create) the journal at `path` and replay it
    ///
    /// Returns the journal positioned for appends, the replayed mutations
    /// and a replay summary. A damaged tail is truncated.
    pub fn open(path: impl AsRef<Path>, mode: DurabilityMode) -> TempoResult<(Self, Vec<Mutation>, ReplayReport)> {
        let path = path.as_ref().to_path_buf();
        let mut contents = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut contents)?;
        }

        let mut report = ReplayReport::default();
        let mut mutations = Vec::new();

        if contents.len() < HEADER_SIZE {
            // Missing, empty, or crashed before the header was complete
            write_fresh(&path, &[])?;
        } else {
            if &contents[..8] != JOURNAL_MAGIC {
                return Err(TempoError::corruption(format!(
                    "{} is not a journal file (bad magic)",
                    path.display()
                )));
            }
            let version = u16::from_le_bytes([contents[8], contents[9]]);
            if version != JOURNAL_VERSION {
                return Err(TempoError::corruption(format!(
                    "unsupported journal version {} in {}",
                    version,
                    path.display()
                )));
            }

            let decoded = decode_records(&contents[HEADER_SIZE..]);
            if let Some(reason) = &decoded.torn {
                let keep = (HEADER_SIZE + decoded.valid_len) as u64;
                report.truncated_bytes = contents.len() as u64 - keep;
                warn!(
                    target: "tempo::journal",
                    path = %path.display(),
                    reason = %reason,
                    truncated_bytes = report.truncated_bytes,
                    "Truncating damaged journal tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(keep)?;
                file.sync_all()?;
            }
            report.records = decoded.mutations.len();
            mutations = decoded.mutations;
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        info!(
            target: "tempo::journal",
            path = %path.display(),
            records = report.records,
            mode = %mode,
            "Journal opened"
        );
        Ok((
            Journal {
                path,
                mode,
                writer: Mutex::new(BufWriter::new(file)),
            },
            mutations,
            report,
        ))
    }

    /// Path of the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durability mode of appends
    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Append one mutation
    pub fn append(&self, mutation: &Mutation) -> TempoResult<()> {
        self.append_all(std::slice::from_ref(mutation))
    }

    /// Append several mutations with a single flush
    pub fn append_all(&self, mutations: &[Mutation]) -> TempoResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        for mutation in mutations {
            writer.write_all(&encode_record(mutation)?)?;
        }
        writer.flush()?;
        if self.mode.requires_immediate_fsync() {
            writer.get_ref().sync_data()?;
        }
        debug!(target: "tempo::journal", records = mutations.len(), "Appended");
        Ok(())
    }

    /// Replace the journal with a minimal one reproducing `snapshot`
    ///
    /// The new file is written next to the old one, synced, and renamed
    /// over it.
    pub fn compact(&self, snapshot: &[Mutation]) -> TempoResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let tmp = self.path.with_extension("journal.compact");
        write_fresh(&tmp, snapshot)?;
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        *writer = BufWriter::new(file);
        info!(
            target: "tempo::journal",
            path = %self.path.display(),
            records = snapshot.len(),
            "Journal compacted"
        );
        Ok(())
    }

    /// Flush and fsync buffered appends
    pub fn sync(&self) -> TempoResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Write a complete journal file (header plus records) and fsync it
fn write_fresh(path: &Path, mutations: &[Mutation]) -> TempoResult<()> {
    let mut buffer = encode_header();
    for mutation in mutations {
        buffer.extend_from_slice(&encode_record(mutation)?);
    }
    let mut file = File::create(path)?;
    file.write_all(&buffer)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tempo_core::{BranchName, TemporalEntry, TemporalKey};

    fn put(ts: u64) -> Mutation {
        Mutation::PutEntries {
            branch: BranchName::master(),
            entries: vec![TemporalEntry::new(TemporalKey::new("kv", "x", ts), b"v".to_vec())],
        }
    }

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tempo.journal");
        (dir, path)
    }

    #[test]
    fn test_append_and_replay() {
        let (_dir, path) = setup();
        {
            let (journal, replayed, _) = Journal::open(&path, DurabilityMode::Standard).unwrap();
            assert!(replayed.is_empty());
            journal.append(&put(1)).unwrap();
            journal.append_all(&[put(2), put(3)]).unwrap();
        }
        let (_, replayed, report) = Journal::open(&path, DurabilityMode::Always).unwrap();
        assert_eq!(replayed, vec![put(1), put(2), put(3)]);
        assert_eq!(report, ReplayReport { records: 3, truncated_bytes: 0 });
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let (_dir, path) = setup();
        {
            let (journal, _, _) = Journal::open(&path, DurabilityMode::Standard).unwrap();
            journal.append_all(&[put(1), put(2)]).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let frame = encode_record(&put(3)).unwrap();
            file.write_all(&frame[..frame.len() - 3]).unwrap();
        }

        let (journal, replayed, report) = Journal::open(&path, DurabilityMode::Standard).unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(report.truncated_bytes > 0);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        journal.append(&put(4)).unwrap();
        drop(journal);
        let (_, replayed, _) = Journal::open(&path, DurabilityMode::Standard).unwrap();
        assert_eq!(replayed, vec![put(1), put(2), put(4)]);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let mut body = encode_record(&put(1)).unwrap();
        let mut second = encode_record(&put(2)).unwrap();
        let last = second.len() - 1;
        second[last] ^= 0xFF;
        body.extend_from_slice(&second);

        let decoded = decode_records(&body);
        assert_eq!(decoded.mutations, vec![put(1)]);
        assert!(decoded.torn.unwrap().contains("checksum"));
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let (_dir, path) = setup();
        fs::write(&path, b"NOTAJOURNALFILE!").unwrap();
        let err = Journal::open(&path, DurabilityMode::Standard).unwrap_err();
        assert!(matches!(err, TempoError::Corruption { .. }));
    }

    #[test]
    fn test_compact_rewrites_file() {
        let (_dir, path) = setup();
        let (journal, _, _) = Journal::open(&path, DurabilityMode::Standard).unwrap();
        for ts in 0..50 {
            journal.append(&put(ts)).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        journal.compact(&[put(49)]).unwrap();
        assert!(fs::metadata(&path).unwrap().len() < before);

        journal.append(&put(50)).unwrap();
        drop(journal);
        let (_, replayed, _) = Journal::open(&path, DurabilityMode::Standard).unwrap();
        assert_eq!(replayed, vec![put(49), put(50)]);
    }
}
