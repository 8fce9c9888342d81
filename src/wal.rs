use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{DEFAULT_DURATION, Minutes};
use crate::source::CommitmentRecord;
use crate::time::{format_clock, parse_clock};

/// One entry of a tenant's commitment log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    CommitmentRecorded {
        id: Ulid,
        date: NaiveDate,
        start: Minutes,
        duration: Minutes,
        label: String,
    },
    CommitmentCancelled {
        id: Ulid,
    },
}

impl LedgerEvent {
    fn recorded(record: &CommitmentRecord) -> Option<Self> {
        Some(Self::CommitmentRecorded {
            id: record.id,
            date: record.date,
            start: parse_clock(&record.start_time)?,
            duration: record.duration_minutes.unwrap_or(DEFAULT_DURATION),
            label: record.label.clone(),
        })
    }
}

/// Live commitments keyed by id.
pub type LiveCommitments = BTreeMap<Ulid, CommitmentRecord>;

/// Fold one event into the live set. Returns how many log entries stopped
/// describing a live commitment: a cancel retires itself and its record.
pub fn apply(live: &mut LiveCommitments, event: &LedgerEvent) -> u64 {
    match event {
        LedgerEvent::CommitmentRecorded {
            id,
            date,
            start,
            duration,
            label,
        } => {
            let replaced = live.insert(
                *id,
                CommitmentRecord {
                    id: *id,
                    date: *date,
                    start_time: format_clock(*start),
                    duration_minutes: Some(*duration),
                    label: label.clone(),
                },
            );
            u64::from(replaced.is_some())
        }
        LedgerEvent::CommitmentCancelled { id } => match live.remove(id) {
            Some(_) => 2,
            None => 1,
        },
    }
}

const FRAME_OVERHEAD: u64 = 8;

fn write_frame(writer: &mut impl Write, event: &LedgerEvent) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Next intact frame and its size on disk. `None` at end of file or at the
/// first torn or corrupt frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(LedgerEvent, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, payload.len() as u64 + FRAME_OVERHEAD)))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of reading a log from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub live: LiveCommitments,
    /// Entries that no longer describe a live commitment.
    pub stale: u64,
    /// Length of the intact prefix. Anything past it is a torn tail.
    pub valid_len: u64,
}

/// Append-only commitment log, one file per tenant.
///
/// Frame: `[u32 le: len][bincode LedgerEvent][u32 le: crc32 of payload]`.
/// Opening a log folds it into the live commitment set and cuts off any
/// torn tail before the first append.
pub struct CommitmentLog {
    writer: BufWriter<File>,
    path: PathBuf,
    stale: u64,
}

impl CommitmentLog {
    /// Replay `path`, truncate any torn tail and open it for appends.
    pub fn open(path: &Path) -> io::Result<(Self, LiveCommitments)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() > replay.valid_len {
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(path)?;
        let log = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            stale: replay.stale,
        };
        Ok((log, replay.live))
    }

    /// Fold every intact entry of `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        while let Some((event, size)) = read_frame(&mut reader)? {
            replay.stale += apply(&mut replay.live, &event);
            replay.valid_len += size;
        }
        Ok(replay)
    }

    /// Buffer one event. Nothing is durable until `sync`.
    pub fn append(&mut self, event: &LedgerEvent) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        if let LedgerEvent::CommitmentCancelled { .. } = event {
            self.stale += 2;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn stale_entries(&self) -> u64 {
        self.stale
    }

    /// Replace the log with one `CommitmentRecorded` per live commitment.
    /// The new file is fully synced before it is renamed into place.
    pub fn rewrite(&mut self, live: &LiveCommitments) -> io::Result<()> {
        self.sync()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in live.values().filter_map(LedgerEvent::recorded) {
                write_frame(&mut writer, &event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.stale = 0;
        Ok(())
    }
}
