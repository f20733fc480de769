use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame one booking event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the journal ended mid-frame.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next frame. `Ok(None)` at the end of the journal or at the
/// first frame that is torn or fails its checksum; replay stops there.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// The booking journal: every user, resource and booking change, one frame
/// per [`Event`], in the order the writer committed them.
///
/// Frame: `[u32 len][bincode Event][u32 crc32]`, little endian. Only whole
/// batches are kept; a batch that fails to reach disk is cut back off
/// with [`Wal::rollback`], so the file never holds a booking that its
/// caller was told failed.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length at the end of the last synced batch.
    committed_len: u64,
    /// Frames buffered since the last sync.
    pending: u64,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            pending: 0,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Frame an event into the write buffer. Nothing is durable until
    /// `flush_sync` returns Ok.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.pending += 1;
        Ok(())
    }

    /// Write out the buffered batch and fsync it.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_sync) {
            return Err(io::Error::other("injected fsync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.committed_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += std::mem::take(&mut self.pending);
        Ok(())
    }

    /// Drop the unsynced batch: discard whatever is still buffered and cut
    /// the file back to the last committed length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let (stale, _unwritten) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        stale.set_len(self.committed_len)?;
        stale.sync_all()?;
        self.pending = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed frames since the journal was opened or last compacted.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a state snapshot (users, resources, bookings with their
    /// current status) to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the journal and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Rebuild the event sequence for startup. A missing file means a fresh
    /// deployment with no users, resources or bookings.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = decode_next(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, BookingStatus, Resource, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("booker_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn resource_created(id: Ulid) -> Event {
        Event::ResourceCreated {
            resource: Resource {
                id,
                name: "Room A".into(),
                kind: "room".into(),
                available: true,
                description: None,
                location: None,
            },
        }
    }

    fn booking_created(resource_id: Ulid, start: i64) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                user_id: Ulid::new(),
                resource_id,
                span: Span::new(start, start + 1000),
                status: BookingStatus::Active,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let rid = Ulid::new();
        let events = vec![resource_created(rid), booking_created(rid, 0)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::ResourceDeleted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let rid = Ulid::new();
        let snapshot = vec![resource_created(rid)];

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&snapshot[0]).unwrap();
        for i in 0..20 {
            wal.append(&booking_created(rid, i * 10_000)).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} < {before}");

        let later = booking_created(rid, 999_000);
        wal.append(&later).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
    }

    #[test]
    fn buffered_appends_count_once_synced() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| resource_created(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 0);
            wal.flush_sync().unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn failed_sync_is_rolled_back() {
        let path = tmp_path("rollback.wal");
        let rid = Ulid::new();
        let kept = resource_created(rid);
        let lost = booking_created(rid, 0);

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let committed = fs::metadata(&path).unwrap().len();

        wal.append_buffered(&lost).unwrap();
        wal.fail_next_sync();
        assert!(wal.flush_sync().is_err());
        // The bytes reached the file before the sync failed.
        assert!(fs::metadata(&path).unwrap().len() > committed);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
        assert_eq!(wal.appends_since_compact(), 1);

        let next = booking_created(rid, 5_000);
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);
    }

    #[test]
    fn reopen_resumes_at_committed_length() {
        let path = tmp_path("reopen_len.wal");
        let first = resource_created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        let second = resource_created(Ulid::new());
        wal.append_buffered(&second).unwrap();
        wal.rollback().unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
    }
}
