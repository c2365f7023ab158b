//! Persisted scheduling ledger (resilience level 2).
//!
//! Append-only little-endian binary file with a small trailer index. Each
//! record: a kind byte, the task id (8 bytes), then kind-specific fields.
//! Strings are length-prefixed, dependency maps end with `EOM\0`, ordered
//! key lists with `EOV\0`, and every object with `EOO\0`; the same rules
//! apply recursively to events nested in records. A recovering process
//! replays the file and re-registers whatever had not completed, resolving
//! task functions through a name-keyed registry.

use crate::event::{DependencyKey, Event};
use crate::scheduler::task::{PendingTask, TaskId};
use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EOM: [u8; 4] = *b"EOM\0";
const EOV: [u8; 4] = *b"EOV\0";
const EOO: [u8; 4] = *b"EOO\0";
const TRAILER_MAGIC: [u8; 4] = *b"EOL\0";

const KIND_TASK_SCHEDULED: u8 = 1;
const KIND_TASK_RUNNING: u8 = 2;
const KIND_TASK_COMPLETED: u8 = 3;
const KIND_EVENT_ARRIVED: u8 = 4;
const KIND_EVENT_MOVED: u8 = 5;

/// Function-free image of a pending task, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TaskRecord {
    pub(crate) task_id: u64,
    pub(crate) fn_id: u32,
    pub(crate) num_arrived: u32,
    pub(crate) persistent: bool,
    pub(crate) resilience: i32,
    pub(crate) name: String,
    pub(crate) outstanding: Vec<(DependencyKey, u32)>,
    pub(crate) order: Vec<DependencyKey>,
    pub(crate) original: Vec<(DependencyKey, u32)>,
}

impl TaskRecord {
    fn from_task(task: &PendingTask) -> TaskRecord {
        TaskRecord {
            task_id: task.task_id.as_u64(),
            fn_id: task.fn_id,
            num_arrived: task.deps.num_arrived,
            persistent: task.persistent,
            resilience: task.resilience,
            name: task.name.clone(),
            outstanding: task.deps.outstanding.iter().cloned().collect(),
            order: task.deps.order.clone(),
            original: task.original.iter().cloned().collect(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Record {
    TaskScheduled(TaskRecord),
    TaskRunning(u64),
    TaskCompleted(u64),
    EventArrived(Event),
    EventMoved { key: DependencyKey, task_id: u64 },
}

struct LedgerFile {
    writer: BufWriter<File>,
    offsets: Vec<u64>,
    position: u64,
}

pub(crate) struct ProcessLedger {
    path: PathBuf,
    file: Mutex<LedgerFile>,
}

impl ProcessLedger {
    pub(crate) fn create<P: AsRef<Path>>(path: P) -> Result<Arc<ProcessLedger>> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("cannot create ledger file {}", path.display()))?;
        Ok(Arc::new(ProcessLedger {
            path,
            file: Mutex::new(LedgerFile {
                writer: BufWriter::new(file),
                offsets: Vec::new(),
                position: 0,
            }),
        }))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn task_scheduled(&self, task: &PendingTask) {
        let mut body = Vec::new();
        encode_task_record(&TaskRecord::from_task(task), &mut body);
        self.append(KIND_TASK_SCHEDULED, task.task_id.as_u64(), &body);
    }

    pub(crate) fn task_running(&self, task_id: TaskId) {
        self.append(KIND_TASK_RUNNING, task_id.as_u64(), &[]);
    }

    pub(crate) fn task_completed(&self, task_id: TaskId) {
        self.append(KIND_TASK_COMPLETED, task_id.as_u64(), &[]);
    }

    pub(crate) fn event_arrived(&self, event: &Event) {
        let mut body = Vec::new();
        encode_event(event, &mut body);
        self.append(KIND_EVENT_ARRIVED, 0, &body);
    }

    pub(crate) fn event_moved(&self, key: &DependencyKey, task_id: TaskId) {
        let mut body = Vec::new();
        encode_key(key, &mut body);
        self.append(KIND_EVENT_MOVED, task_id.as_u64(), &body);
    }

    fn append(&self, kind: u8, task_id: u64, body: &[u8]) {
        let mut file = self.file.lock();
        let offset = file.position;
        let mut header = Vec::with_capacity(9);
        header.push(kind);
        header.write_u64::<LittleEndian>(task_id).unwrap();
        let write = (|| {
            file.writer.write_all(&header)?;
            file.writer.write_all(body)
        })();
        if let Err(err) = write {
            // Losing the recovery trail makes level-2 guarantees a lie.
            panic!("resilience ledger write failed: {}", err);
        }
        file.offsets.push(offset);
        file.position += (header.len() + body.len()) as u64;
    }

    /// Write the trailer index and flush: record offsets, record count,
    /// magic tag.
    pub(crate) fn finalise(&self) -> Result<()> {
        let mut file = self.file.lock();
        let mut trailer = Vec::with_capacity(file.offsets.len() * 8 + 8);
        for offset in &file.offsets {
            trailer.write_u64::<LittleEndian>(*offset).unwrap();
        }
        trailer
            .write_u32::<LittleEndian>(file.offsets.len() as u32)
            .unwrap();
        trailer.extend_from_slice(&TRAILER_MAGIC);
        file.writer.write_all(&trailer)?;
        file.writer.flush()?;
        Ok(())
    }

    /// Parse a finalised ledger file back into records.
    pub(crate) fn load<P: AsRef<Path>>(path: P) -> Result<Vec<Record>> {
        let mut raw = Vec::new();
        File::open(path.as_ref())
            .with_context(|| format!("cannot open ledger file {}", path.as_ref().display()))?
            .read_to_end(&mut raw)?;
        if raw.len() < 8 || raw[raw.len() - 4..] != TRAILER_MAGIC {
            bail!("ledger trailer not found, file was not finalised");
        }
        let count = u32::from_le_bytes(raw[raw.len() - 8..raw.len() - 4].try_into().unwrap());
        let index_start = raw
            .len()
            .checked_sub(8 + count as usize * 8)
            .context("ledger trailer index exceeds file")?;
        let mut records = Vec::with_capacity(count as usize);
        let mut index = Cursor::new(&raw[index_start..raw.len() - 8]);
        for _ in 0..count {
            let offset = index.read_u64::<LittleEndian>()? as usize;
            if offset >= index_start {
                bail!("ledger record offset points into the trailer");
            }
            records.push(decode_record(&raw[offset..index_start])?);
        }
        Ok(records)
    }

    /// Reduce a record stream to what a recovering process must re-register:
    /// the last scheduled image of every task that never completed, and
    /// every arrived event not consumed by a completed task.
    pub(crate) fn replay(records: Vec<Record>) -> RecoveredState {
        let mut tasks: Vec<TaskRecord> = Vec::new();
        let mut events: Vec<Event> = Vec::new();
        let mut completed: Vec<u64> = Vec::new();
        let mut moved: Vec<(DependencyKey, u64)> = Vec::new();

        for record in records {
            match record {
                Record::TaskScheduled(task) => {
                    tasks.retain(|t| t.task_id != task.task_id);
                    tasks.push(task);
                }
                Record::TaskRunning(_) => {}
                Record::TaskCompleted(task_id) => completed.push(task_id),
                Record::EventArrived(event) => events.push(event),
                Record::EventMoved { key, task_id } => moved.push((key, task_id)),
            }
        }

        tasks.retain(|task| !completed.contains(&task.task_id));
        for (key, task_id) in moved {
            if completed.contains(&task_id) {
                if let Some(pos) = events.iter().position(|e| key.matches(&e.key())) {
                    events.remove(pos);
                }
            }
        }
        RecoveredState { tasks, events }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecoveredState {
    pub(crate) tasks: Vec<TaskRecord>,
    pub(crate) events: Vec<Event>,
}

// --- codec ---

fn encode_string(value: &str, out: &mut Vec<u8>) {
    out.write_u32::<LittleEndian>(value.len() as u32).unwrap();
    out.extend_from_slice(value.as_bytes());
}

fn decode_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).context("ledger string is not valid utf-8")
}

pub(crate) fn encode_key(key: &DependencyKey, out: &mut Vec<u8>) {
    encode_string(key.id(), out);
    out.write_i32::<LittleEndian>(key.rank()).unwrap();
}

pub(crate) fn decode_key(cursor: &mut Cursor<&[u8]>) -> Result<DependencyKey> {
    let id = decode_string(cursor)?;
    let rank = cursor.read_i32::<LittleEndian>()?;
    Ok(DependencyKey::new(rank, &id))
}

pub(crate) fn encode_event(event: &Event, out: &mut Vec<u8>) {
    out.write_i32::<LittleEndian>(event.source()).unwrap();
    out.write_i32::<LittleEndian>(event.element_count() as i32)
        .unwrap();
    out.write_i32::<LittleEndian>(event.raw_data_length() as i32)
        .unwrap();
    out.write_i32::<LittleEndian>(event.type_tag()).unwrap();
    out.push(u8::from(event.is_persistent()));
    out.push(u8::from(event.is_context()));
    if let Some(bytes) = event.bytes() {
        out.extend_from_slice(bytes);
    }
    encode_string(event.id(), out);
    out.extend_from_slice(&EOO);
}

pub(crate) fn decode_event(cursor: &mut Cursor<&[u8]>) -> Result<Event> {
    let source = cursor.read_i32::<LittleEndian>()?;
    let _elements = cursor.read_i32::<LittleEndian>()?;
    let raw_len = cursor.read_i32::<LittleEndian>()? as usize;
    let tag = cursor.read_i32::<LittleEndian>()?;
    let persistent = cursor.read_u8()? != 0;
    let _context = cursor.read_u8()? != 0;
    let data = if raw_len > 0 {
        let mut bytes = vec![0u8; raw_len];
        cursor.read_exact(&mut bytes)?;
        Some(bytes.into_boxed_slice())
    } else {
        None
    };
    let id = decode_string(cursor)?;
    expect_marker(cursor, &EOO, "event")?;
    Event::from_wire(source, tag, persistent, id, data)
        .with_context(|| format!("unknown event type tag {} in ledger", tag))
}

fn encode_counts(entries: &[(DependencyKey, u32)], out: &mut Vec<u8>) {
    for (key, count) in entries {
        encode_key(key, out);
        out.write_u32::<LittleEndian>(*count).unwrap();
    }
    out.extend_from_slice(&EOM);
}

fn decode_counts(cursor: &mut Cursor<&[u8]>) -> Result<Vec<(DependencyKey, u32)>> {
    let mut entries = Vec::new();
    while !peek_marker(cursor, &EOM) {
        let key = decode_key(cursor)?;
        let count = cursor.read_u32::<LittleEndian>()?;
        entries.push((key, count));
    }
    skip_marker(cursor);
    Ok(entries)
}

pub(crate) fn encode_task_record(task: &TaskRecord, out: &mut Vec<u8>) {
    out.write_u64::<LittleEndian>(task.task_id).unwrap();
    out.write_u32::<LittleEndian>(task.fn_id).unwrap();
    out.write_u32::<LittleEndian>(task.num_arrived).unwrap();
    out.push(u8::from(task.persistent));
    out.write_i32::<LittleEndian>(task.resilience).unwrap();
    encode_string(&task.name, out);
    encode_counts(&task.outstanding, out);
    for key in &task.order {
        encode_key(key, out);
    }
    out.extend_from_slice(&EOV);
    encode_counts(&task.original, out);
    out.extend_from_slice(&EOO);
}

pub(crate) fn decode_task_record(cursor: &mut Cursor<&[u8]>) -> Result<TaskRecord> {
    let task_id = cursor.read_u64::<LittleEndian>()?;
    let fn_id = cursor.read_u32::<LittleEndian>()?;
    let num_arrived = cursor.read_u32::<LittleEndian>()?;
    let persistent = cursor.read_u8()? != 0;
    let resilience = cursor.read_i32::<LittleEndian>()?;
    let name = decode_string(cursor)?;
    let outstanding = decode_counts(cursor)?;
    let mut order = Vec::new();
    while !peek_marker(cursor, &EOV) {
        order.push(decode_key(cursor)?);
    }
    skip_marker(cursor);
    let original = decode_counts(cursor)?;
    expect_marker(cursor, &EOO, "task record")?;
    Ok(TaskRecord {
        task_id,
        fn_id,
        num_arrived,
        persistent,
        resilience,
        name,
        outstanding,
        order,
        original,
    })
}

fn decode_record(raw: &[u8]) -> Result<Record> {
    let mut cursor = Cursor::new(raw);
    let kind = cursor.read_u8()?;
    let task_id = cursor.read_u64::<LittleEndian>()?;
    match kind {
        KIND_TASK_SCHEDULED => Ok(Record::TaskScheduled(decode_task_record(&mut cursor)?)),
        KIND_TASK_RUNNING => Ok(Record::TaskRunning(task_id)),
        KIND_TASK_COMPLETED => Ok(Record::TaskCompleted(task_id)),
        KIND_EVENT_ARRIVED => Ok(Record::EventArrived(decode_event(&mut cursor)?)),
        KIND_EVENT_MOVED => Ok(Record::EventMoved {
            key: decode_key(&mut cursor)?,
            task_id,
        }),
        other => bail!("unknown ledger record kind {}", other),
    }
}

fn peek_marker(cursor: &mut Cursor<&[u8]>, marker: &[u8; 4]) -> bool {
    let pos = cursor.position() as usize;
    let raw = *cursor.get_ref();
    raw.len() >= pos + 4 && raw[pos..pos + 4] == *marker
}

fn skip_marker(cursor: &mut Cursor<&[u8]>) {
    cursor.set_position(cursor.position() + 4);
}

fn expect_marker(cursor: &mut Cursor<&[u8]>, marker: &[u8; 4], what: &str) -> Result<()> {
    if !peek_marker(cursor, marker) {
        bail!("{} deserialization error, terminator not found", what);
    }
    skip_marker(cursor);
    Ok(())
}
