use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one `[len][payload][crc]` frame. `Ok(None)` means a clean or truncated end.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Append-only Write-Ahead Log for the reservation set and ride catalog.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt tail (crash mid-write) is discarded on replay and
///   cut off by [`Wal::recover`] before new frames are appended.
///
/// Appends collect in memory until `flush_sync`. The file never holds more than
/// `committed_len` bytes of acknowledged frames plus the batch being flushed.
pub struct Wal {
    file: File,
    path: PathBuf,
    pending: Vec<u8>,
    pending_events: u64,
    committed_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_events: 0,
            committed_len,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Encode into the pending batch. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let mark = self.pending.len();
        if let Err(e) = encode_event(&mut self.pending, event) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_events += 1;
        Ok(())
    }

    /// Write the pending batch and fsync. On failure the file is cut back to
    /// the last committed frame and the batch is dropped.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let result = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_all());
        match result {
            Ok(()) => {
                self.committed_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_events;
                self.pending.clear();
                self.pending_events = 0;
                Ok(())
            }
            Err(e) => {
                if let Err(cut) = self.rollback() {
                    tracing::error!("WAL rollback after failed flush also failed: {cut}");
                }
                Err(e)
            }
        }
    }

    /// Drop the pending batch and cut the file back to the last committed frame.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.pending_events = 0;
        self.file.set_len(self.committed_len)?;
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted snapshot to a temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.pending_events = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events in order.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::replay_prefix(path)?.0)
    }

    /// Replay, then cut off any torn or corrupt tail so that later appends
    /// land directly after the last valid frame.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = Self::replay_prefix(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                "discarding {} bytes of torn WAL tail in {}",
                file_len - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Valid events and the byte length of the prefix that holds them.
    fn replay_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;

        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    events.push(event);
                    valid_len += 8 + payload.len() as u64;
                }
                Err(_) => break,
            }
        }

        Ok((events, valid_len))
    }
}
