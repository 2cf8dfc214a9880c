//! In-process device emulator.
//!
//! Speaks the device side of the link over any byte stream: reads frames
//! through a [`FrameBuffer`], answers with string uuids the way the phone
//! does, and implements:
//! - `filesystem` downloads, uploads, removal and directory listing
//! - `deviceInfo` GET
//! - scripted tasks on any endpoint (POST to start, GET `{id}` to poll)
//!
//! Faults can be injected per request number (1-based, counting every
//! request the emulator receives) or per chunk number.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use desklink::emulator::DeviceEmulator;
//! use desklink::engine::TransactionEngine;
//! use desklink::protocol::{Endpoint, Method};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> desklink::Result<()> {
//! let emulator = DeviceEmulator::builder().build();
//! let mut engine = TransactionEngine::new(emulator.connect());
//!
//! let response = engine
//!     .request(Endpoint::DEVICE_INFO, Method::Get, &(), Duration::from_secs(1))
//!     .await?;
//! assert!(response.status.is_success());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::codec::{ChunkCodec, Crc32, JsonCodec};
use crate::error::Result;
use crate::protocol::{build_frame, Endpoint, Frame, FrameBuffer, Method, Request, Status};
use crate::transfer::wire::{
    ChunkAck, ChunkData, ChunkFetch, ChunkUpload, DirEntry, EntryKind, FileInfo,
    FileInfoRequest, ListDir, RemoveFile, UploadGrant, UploadRequest,
};
use crate::transport::Transport;

/// Chunk size the phone firmware grants.
pub const DEFAULT_CHUNK_SIZE: usize = 12 * 1024;

/// First rxID/txID handed out.
const FIRST_TRANSFER_ID: u32 = 1000;

/// Buffer size of the in-memory pipe created by [`DeviceEmulator::connect`].
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Where the emulator reports a download's `fileCrc32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcPlacement {
    /// In the file-info response.
    FileInfo,
    /// In the last chunk's response, like the phone.
    #[default]
    LastChunk,
    /// Nowhere.
    Omitted,
}

/// Misbehavior to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip the first byte of this chunk number on every download.
    CorruptChunk { chunk_no: u32 },
    /// Answer request number `request` with a different uuid.
    MismatchedUuid { request: usize },
    /// Never answer request number `request`.
    Silence { request: usize },
    /// Answer request number `request` with bytes that are not a header.
    GarbageHeader { request: usize },
    /// Close the stream instead of answering request number `request`.
    Hangup { request: usize },
    /// Hold the answer to request number `request` and write it just
    /// before the answer to the next request.
    Late { request: usize },
}

impl Fault {
    fn request(&self) -> Option<usize> {
        match *self {
            Fault::CorruptChunk { .. } => None,
            Fault::MismatchedUuid { request }
            | Fault::Silence { request }
            | Fault::GarbageHeader { request }
            | Fault::Hangup { request }
            | Fault::Late { request } => Some(request),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskStep {
    Running,
    Finished,
    Error(String),
}

/// The sequence of states a task reports, one per status query. The last
/// state repeats forever.
#[derive(Debug, Clone)]
pub struct TaskScript {
    steps: Vec<TaskStep>,
    finished_status: Status,
}

impl TaskScript {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            finished_status: Status::OK,
        }
    }

    /// Report `running` for the next `polls` queries.
    pub fn running(mut self, polls: usize) -> Self {
        self.steps
            .extend(std::iter::repeat(TaskStep::Running).take(polls));
        self
    }

    /// Then report `finished`.
    pub fn finished(mut self) -> Self {
        self.steps.push(TaskStep::Finished);
        self
    }

    /// Then report `error` with `reason`.
    pub fn error(mut self, reason: impl Into<String>) -> Self {
        self.steps.push(TaskStep::Error(reason.into()));
        self
    }

    /// Status code for `finished` reports (the phone uses 303 for backups).
    pub fn finished_status(mut self, status: Status) -> Self {
        self.finished_status = status;
        self
    }

    fn step(&self, poll: usize) -> TaskStep {
        self.steps
            .get(poll)
            .or_else(|| self.steps.last())
            .cloned()
            .unwrap_or(TaskStep::Finished)
    }
}

impl Default for TaskScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`DeviceEmulator`].
pub struct DeviceEmulatorBuilder {
    chunk_size: usize,
    crc_placement: CrcPlacement,
    files: HashMap<String, Vec<u8>>,
    tasks: HashMap<(Endpoint, String), TaskScript>,
    templates: HashMap<Endpoint, TaskScript>,
    faults: Vec<Fault>,
    device_info: Value,
}

impl DeviceEmulatorBuilder {
    fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            crc_placement: CrcPlacement::default(),
            files: HashMap::new(),
            tasks: HashMap::new(),
            templates: HashMap::new(),
            faults: Vec::new(),
            device_info: json!({
                "deviceModel": "emulator",
                "batteryLevel": "100",
                "serialNumber": "00000000000000",
            }),
        }
    }

    /// Chunk size granted for downloads and uploads.
    ///
    /// Default: 12 KiB
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn crc_placement(mut self, placement: CrcPlacement) -> Self {
        self.crc_placement = placement;
        self
    }

    /// Make `name` available for download.
    pub fn file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), data.into());
        self
    }

    /// Register a task that already exists under `id`.
    pub fn task(mut self, endpoint: Endpoint, id: impl Into<String>, script: TaskScript) -> Self {
        self.tasks.insert((endpoint, id.into()), script);
        self
    }

    /// Let POSTs to `endpoint` start a new task following `script`.
    pub fn task_template(mut self, endpoint: Endpoint, script: TaskScript) -> Self {
        self.templates.insert(endpoint, script);
        self
    }

    pub fn fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Body returned for `deviceInfo` GET.
    pub fn device_info(mut self, body: Value) -> Self {
        self.device_info = body;
        self
    }

    pub fn build(self) -> DeviceEmulator {
        let tasks = self
            .tasks
            .into_iter()
            .map(|(key, script)| (key, TaskRun { script, polls: 0 }))
            .collect();

        DeviceEmulator {
            state: Arc::new(Mutex::new(EmulatorState {
                chunk_size: self.chunk_size,
                crc_placement: self.crc_placement,
                files: self.files,
                downloads: HashMap::new(),
                uploads: HashMap::new(),
                next_transfer_id: FIRST_TRANSFER_ID,
                tasks,
                templates: self.templates,
                started_tasks: 0,
                faults: self.faults,
                device_info: self.device_info,
                journal: Vec::new(),
                held: None,
            })),
        }
    }
}

/// A scriptable stand-in for the phone. Clones share state.
#[derive(Clone)]
pub struct DeviceEmulator {
    state: Arc<Mutex<EmulatorState>>,
}

impl DeviceEmulator {
    pub fn builder() -> DeviceEmulatorBuilder {
        DeviceEmulatorBuilder::new()
    }

    /// Spawn the emulator on one end of an in-memory pipe and return a
    /// transport on the other.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Transport<DuplexStream> {
        let (host, device) = tokio::io::duplex(DUPLEX_CAPACITY);
        let emulator = self.clone();

        tokio::spawn(async move {
            if let Err(e) = emulator.serve(device).await {
                tracing::error!("Emulator loop error: {}", e);
            }
        });

        Transport::new(host, "emulator")
    }

    /// Answer requests on `stream` until the host closes it or a hangup
    /// fault fires.
    pub async fn serve<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frame_buffer = FrameBuffer::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(e.into()),
            };

            for frame in frame_buffer.push(&buf[..n])? {
                let reply = self.lock().handle(&frame)?;
                match reply {
                    Reply::Bytes(bytes) => {
                        stream.write_all(&bytes).await?;
                        stream.flush().await?;
                    }
                    Reply::Silence => {}
                    Reply::Hangup => {
                        tracing::debug!("emulator hanging up");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Every request received so far, in order.
    pub fn journal(&self) -> Vec<Request> {
        self.lock().journal.clone()
    }

    /// Contents of a stored file, including completed uploads.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Reply {
    Bytes(Vec<u8>),
    Silence,
    Hangup,
}

/// Response as the phone serializes it: uuid as a decimal string.
#[derive(Serialize)]
struct DeviceResponse {
    endpoint: Endpoint,
    status: Status,
    uuid: String,
    body: Value,
}

struct DownloadSlot {
    data: Vec<u8>,
    total_chunks: u32,
    crc: Crc32,
}

struct UploadSlot {
    file_name: String,
    file_size: usize,
    file_crc32: String,
    data: Vec<u8>,
    next_chunk: u32,
}

struct TaskRun {
    script: TaskScript,
    polls: usize,
}

struct EmulatorState {
    chunk_size: usize,
    crc_placement: CrcPlacement,
    files: HashMap<String, Vec<u8>>,
    downloads: HashMap<u32, DownloadSlot>,
    uploads: HashMap<u32, UploadSlot>,
    next_transfer_id: u32,
    tasks: HashMap<(Endpoint, String), TaskRun>,
    templates: HashMap<Endpoint, TaskScript>,
    started_tasks: usize,
    faults: Vec<Fault>,
    device_info: Value,
    journal: Vec<Request>,
    held: Option<Vec<u8>>,
}

type Routed = (Status, Value);

impl EmulatorState {
    fn handle(&mut self, frame: &Frame) -> Result<Reply> {
        let request: Request = match JsonCodec::decode(frame.payload()) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("Emulator dropped undecodable request: {}", e);
                return Ok(Reply::Silence);
            }
        };
        self.journal.push(request.clone());
        let number = self.journal.len();

        let mut uuid = request.uuid;
        let mut late = false;
        match self.faults.iter().find(|f| f.request() == Some(number)) {
            Some(Fault::Silence { .. }) => return Ok(Reply::Silence),
            Some(Fault::Hangup { .. }) => return Ok(Reply::Hangup),
            Some(Fault::GarbageHeader { .. }) => return Ok(Reply::Bytes(b"?garbage??".to_vec())),
            Some(Fault::MismatchedUuid { .. }) => uuid = uuid.wrapping_add(1),
            Some(Fault::Late { .. }) => late = true,
            _ => {}
        }

        let (status, body) = self.route(&request);
        tracing::debug!(
            endpoint = %request.endpoint,
            method = %request.method,
            uuid = request.uuid,
            status = status.0,
            "emulator answered"
        );

        let response = DeviceResponse {
            endpoint: request.endpoint,
            status,
            uuid: uuid.to_string(),
            body,
        };
        let bytes = build_frame(&JsonCodec::encode(&response)?)?;
        if late {
            self.held = Some(bytes);
            return Ok(Reply::Silence);
        }
        match self.held.take() {
            Some(mut held) => {
                held.extend_from_slice(&bytes);
                Ok(Reply::Bytes(held))
            }
            None => Ok(Reply::Bytes(bytes)),
        }
    }

    fn route(&mut self, request: &Request) -> Routed {
        let body = &request.body;
        match (request.endpoint, request.method) {
            (Endpoint::FILESYSTEM, Method::Get) if body.get("fileName").is_some() => {
                parse::<FileInfoRequest>(body).map_or_else(|r| r, |req| self.file_info(req))
            }
            (Endpoint::FILESYSTEM, Method::Get) if body.get("listDir").is_some() => {
                parse::<ListDir>(body).map_or_else(|r| r, |req| self.list_dir(req))
            }
            (Endpoint::FILESYSTEM, Method::Get) if body.get("rxID").is_some() => {
                parse::<ChunkFetch>(body).map_or_else(|r| r, |req| self.read_chunk(req))
            }
            (Endpoint::FILESYSTEM, Method::Put) if body.get("fileName").is_some() => {
                parse::<UploadRequest>(body).map_or_else(|r| r, |req| self.start_upload(req))
            }
            (Endpoint::FILESYSTEM, Method::Put) if body.get("txID").is_some() => {
                parse::<ChunkUpload>(body).map_or_else(|r| r, |req| self.write_chunk(req))
            }
            (Endpoint::FILESYSTEM, Method::Delete) => {
                parse::<RemoveFile>(body).map_or_else(|r| r, |req| self.remove_file(req))
            }
            (Endpoint::DEVICE_INFO, Method::Get) => (Status::OK, self.device_info.clone()),
            (endpoint, Method::Post) if self.templates.contains_key(&endpoint) => {
                self.start_task(endpoint)
            }
            (endpoint, Method::Get) if body.get("id").is_some() => self.task_status(endpoint, body),
            _ => (Status::BAD_REQUEST, json!({"reason": "unsupported request"})),
        }
    }

    fn allocate_transfer_id(&mut self) -> u32 {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        id
    }

    fn file_info(&mut self, request: FileInfoRequest) -> Routed {
        let Some(data) = self.files.get(&request.file_name).cloned() else {
            return (Status::NOT_FOUND, json!({"reason": "file does not exist"}));
        };

        let rx_id = self.allocate_transfer_id();
        let crc = Crc32::of(&data);
        let total_chunks = data.len().div_ceil(self.chunk_size.max(1)) as u32;
        let info = FileInfo {
            rx_id,
            file_size: data.len() as u64,
            chunk_size: self.chunk_size as u64,
            file_crc32: (self.crc_placement == CrcPlacement::FileInfo).then(|| crc.to_hex()),
        };
        self.downloads.insert(
            rx_id,
            DownloadSlot {
                data,
                total_chunks,
                crc,
            },
        );
        (Status::OK, to_value(&info))
    }

    fn read_chunk(&mut self, request: ChunkFetch) -> Routed {
        let ChunkFetch { rx_id, chunk_no } = request;
        let in_range = self
            .downloads
            .get(&rx_id)
            .is_some_and(|slot| (1..=slot.total_chunks).contains(&chunk_no));
        if !in_range {
            return (
                Status::BAD_REQUEST,
                json!({"reason": format!("Invalid request rxID: {rx_id}, chunkNo: {chunk_no}")}),
            );
        }

        let chunk_size = self.chunk_size;
        let corrupt = self
            .faults
            .contains(&Fault::CorruptChunk { chunk_no });
        let Some(slot) = self.downloads.get(&rx_id) else {
            return (Status::INTERNAL_SERVER_ERROR, json!({}));
        };

        let start = (chunk_no as usize - 1) * chunk_size;
        let end = (start + chunk_size).min(slot.data.len());
        let mut data = slot.data[start..end].to_vec();
        if corrupt {
            if let Some(byte) = data.first_mut() {
                *byte ^= 0xff;
            }
        }

        let last = chunk_no == slot.total_chunks;
        let chunk = ChunkData {
            rx_id,
            chunk_no,
            data: ChunkCodec::encode(&data),
            file_crc32: (last && self.crc_placement == CrcPlacement::LastChunk)
                .then(|| slot.crc.to_hex()),
        };
        if last {
            self.downloads.remove(&rx_id);
        }
        (Status::OK, to_value(&chunk))
    }

    fn start_upload(&mut self, request: UploadRequest) -> Routed {
        if request.file_size == 0 || request.file_crc32.is_empty() {
            return (Status::BAD_REQUEST, json!({}));
        }

        let tx_id = self.allocate_transfer_id();
        self.uploads.insert(
            tx_id,
            UploadSlot {
                file_name: request.file_name,
                file_size: request.file_size as usize,
                file_crc32: request.file_crc32,
                data: Vec::new(),
                next_chunk: 1,
            },
        );
        let grant = UploadGrant {
            tx_id,
            chunk_size: self.chunk_size as u64,
        };
        (Status::OK, to_value(&grant))
    }

    fn write_chunk(&mut self, request: ChunkUpload) -> Routed {
        let ChunkUpload {
            tx_id,
            chunk_no,
            data,
        } = request;
        let ack = to_value(&ChunkAck {
            tx_id: Some(tx_id),
            chunk_no: Some(chunk_no),
        });

        let Some(slot) = self
            .uploads
            .get_mut(&tx_id)
            .filter(|slot| slot.next_chunk == chunk_no)
        else {
            return (
                Status::BAD_REQUEST,
                json!({"reason": format!("Invalid request txID: {tx_id}, chunkNo: {chunk_no}")}),
            );
        };

        let bytes = match ChunkCodec::decode(&data) {
            Ok(bytes) => bytes,
            Err(e) => return (Status::NOT_ACCEPTABLE, json!({"reason": e.to_string()})),
        };
        slot.data.extend_from_slice(&bytes);
        slot.next_chunk += 1;
        if slot.data.len() < slot.file_size {
            return (Status::OK, ack);
        }

        let Some(slot) = self.uploads.remove(&tx_id) else {
            return (Status::INTERNAL_SERVER_ERROR, json!({}));
        };
        let intact = slot.data.len() == slot.file_size
            && slot
                .file_crc32
                .parse::<Crc32>()
                .is_ok_and(|crc| crc == Crc32::of(&slot.data));
        if !intact {
            return (Status::BAD_REQUEST, ack);
        }
        self.files.insert(slot.file_name, slot.data);
        (Status::OK, ack)
    }

    fn remove_file(&mut self, request: RemoveFile) -> Routed {
        match self.files.remove(&request.remove_file) {
            Some(_) => (Status::NO_CONTENT, json!({})),
            None => (Status::NOT_FOUND, json!({})),
        }
    }

    /// Direct children of a directory. Directories only exist as path
    /// prefixes of stored files, so an unknown or empty one is 404.
    fn list_dir(&self, request: ListDir) -> Routed {
        let prefix = format!("{}/", request.list_dir.trim_end_matches('/'));
        let mut entries = BTreeMap::new();
        for (name, data) in &self.files {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let entry = match rest.split_once('/') {
                Some((sub, _)) => DirEntry {
                    path: format!("{prefix}{sub}"),
                    file_size: 0,
                    kind: EntryKind::Directory,
                },
                None => DirEntry {
                    path: name.clone(),
                    file_size: data.len() as u64,
                    kind: EntryKind::RegularFile,
                },
            };
            entries.insert(entry.path.clone(), entry);
        }
        if entries.is_empty() {
            return (Status::NOT_FOUND, json!({}));
        }

        let listing: Vec<DirEntry> = entries.into_values().collect();
        let mut body = serde_json::Map::new();
        body.insert(request.list_dir, to_value(&listing));
        (Status::OK, Value::Object(body))
    }

    fn start_task(&mut self, endpoint: Endpoint) -> Routed {
        let Some(script) = self.templates.get(&endpoint).cloned() else {
            return (Status::BAD_REQUEST, json!({}));
        };
        self.started_tasks += 1;
        let id = format!("{endpoint}-{}", self.started_tasks);
        self.tasks
            .insert((endpoint, id.clone()), TaskRun { script, polls: 0 });
        (Status::OK, json!({"taskId": id}))
    }

    fn task_status(&mut self, endpoint: Endpoint, body: &Value) -> Routed {
        let id = match &body["id"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let Some(run) = self.tasks.get_mut(&(endpoint, id.clone())) else {
            return (Status::NOT_FOUND, json!({"reason": format!("no task {id}")}));
        };

        let step = run.script.step(run.polls);
        run.polls += 1;
        match step {
            TaskStep::Running => (Status::OK, json!({"id": id, "state": "running"})),
            TaskStep::Finished => (
                run.script.finished_status,
                json!({"id": id, "state": "finished"}),
            ),
            TaskStep::Error(reason) => (
                Status::OK,
                json!({"id": id, "state": "error", "reason": reason}),
            ),
        }
    }
}

/// Parse a request body, or produce the 400 the phone would send.
fn parse<T: DeserializeOwned>(body: &Value) -> std::result::Result<T, Routed> {
    T::deserialize(body).map_err(|e| (Status::BAD_REQUEST, json!({"reason": e.to_string()})))
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| json!({}))
}
