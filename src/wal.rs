use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::limits::MAX_RECORD_LEN;
use crate::model::Record;

/// Bytes around each payload: length prefix and checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Frame a single record as `[len][bincode][crc32]`. Returns the frame size.
fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<u64> {
    let payload = bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record of {} bytes exceeds {MAX_RECORD_LEN}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_OVERHEAD)
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of [`Record`]s.
///
/// Format per entry: `[u32 LE: len][bincode: Record][u32 LE: crc32 of payload]`.
/// A torn or corrupt tail (crash mid-write) ends replay at the last good record
/// and is cut off by [`Wal::recover`] before anything new is appended.
pub struct Wal {
    writer: BufWriter<File>,
    /// Bytes known to be durable: every frame up to here replays.
    durable_len: u64,
    pending_bytes: u64,
    pending_records: u64,
    appends: u64,
}

impl Wal {
    /// Replay the log at `path` (creating it if missing) and open it for
    /// appending right after the last good frame.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Record>)> {
        let (records, valid_len) = Self::scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                "{}: cutting {} bytes of damaged tail after {} records",
                path.display(),
                on_disk - valid_len,
                records.len()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            durable_len: valid_len,
            pending_bytes: 0,
            pending_records: 0,
            appends: 0,
        };
        Ok((wal, records))
    }

    /// Append and fsync one record. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without flushing. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, record: &Record) -> io::Result<()> {
        self.pending_bytes += encode_record(&mut self.writer, record)?;
        self.pending_records += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_bytes;
        self.appends += self.pending_records;
        self.pending_bytes = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`, both
    /// from the buffer and from any part already written to the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        // into_parts hands back the buffer instead of writing it out.
        let (_, _unwritten) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.pending_bytes = 0;
        self.pending_records = 0;
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    /// Records made durable through this handle.
    pub fn appends(&self) -> u64 {
        self.appends
    }

    /// Every valid record on disk, in write order.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        Ok(Self::scan(path)?.0)
    }

    /// Read valid records and the byte length they span. A missing file is
    /// an empty log.
    fn scan(path: &Path) -> io::Result<(Vec<Record>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_RECORD_LEN {
                tracing::warn!("{}: frame length {len} after {} records, ignoring tail", path.display(), records.len());
                break;
            }
            let mut payload = vec![0u8; len];
            if !read_frame_part(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("{}: checksum mismatch after {} records, ignoring tail", path.display(), records.len());
                break;
            }
            match bincode::deserialize::<Record>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("{}: undecodable record after {}: {e}", path.display(), records.len());
                    break;
                }
            }
            valid_len += len as u64 + FRAME_OVERHEAD;
        }

        Ok((records, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("tzledger_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn profile_created(name: &str) -> Record {
        Record::ProfileCreated(Profile {
            id: Ulid::new(),
            name: name.into(),
            timezone: "UTC".into(),
            created_at: 1,
            updated_at: 1,
        })
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let pid = Ulid::new();
        let eid = Ulid::new();
        let records = vec![
            profile_created("Alice"),
            Record::EventCreated(EventRecord {
                id: eid,
                timezone: "Europe/Lisbon".into(),
                start: 1000,
                end: 2000,
                profiles: vec![pid],
                logs: vec![],
                created_at: 5,
                updated_at: 5,
            }),
            Record::EventUpdated {
                id: eid,
                timezone: "Europe/Lisbon".into(),
                start: 1000,
                end: 9000,
                profiles: vec![pid],
                entry: ChangeLogEntry {
                    timestamp: 6,
                    changes: vec![FieldChange::End { from: 2000, to: 9000 }],
                },
            },
        ];

        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            for r in &records {
                wal.append(r).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), records);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let record = profile_created("Alice");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append(&record).unwrap();
        }
        // A torn second frame: length prefix plus a couple of bytes.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![record]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = profile_created("Alice");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&profile_created("Bob")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_appends_after_existing_records() {
        let path = tmp_path("reopen.wal");
        let first = profile_created("Alice");
        let second = profile_created("Bob");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let records: Vec<Record> = (0..5).map(|i| profile_created(&format!("p{i}"))).collect();

        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            for r in &records {
                wal.append_buffered(r).unwrap();
            }
            assert_eq!(wal.appends(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends(), 5);
        }

        assert_eq!(Wal::replay(&path).unwrap(), records);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let alice = profile_created("Alice");
        let bob = profile_created("Bob");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append(&alice).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        }
        {
            let (mut wal, records) = Wal::recover(&path).unwrap();
            assert_eq!(records, vec![alice.clone()]);
            wal.append(&bob).unwrap();
        }

        let (_, records) = Wal::recover(&path).unwrap();
        assert_eq!(records, vec![alice, bob]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_a_corrupt_tail() {
        let path = tmp_path("oversized_len.wal");
        let alice = profile_created("Alice");
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.append(&alice).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![alice]);
        let _ = Wal::recover(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_unflushed_frames() {
        let path = tmp_path("rollback.wal");
        let kept = profile_created("Alice");
        let (mut wal, _) = Wal::recover(&path).unwrap();
        wal.append(&kept).unwrap();
        let durable = fs::metadata(&path).unwrap().len();

        // Enough frames to overflow the write buffer, so some bytes reach the file.
        for i in 0..500 {
            wal.append_buffered(&profile_created(&format!("p{i}"))).unwrap();
        }
        assert!(fs::metadata(&path).unwrap().len() > durable);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        assert_eq!(wal.appends(), 1);

        let later = profile_created("Bob");
        wal.append(&later).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }
}
