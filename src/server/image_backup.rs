//! Image protocol engine: drives one block-level image transfer from a
//! client into a container plus hash sidecar.
//!
//! One engine instance runs per in-flight transfer, on its own thread,
//! reading from the authenticated byte stream the session layer hands
//! out. The transfer is a state machine:
//!
//! ```text
//! Connecting -> Negotiating -> Streaming -> Completing -> Done
//! Streaming  -> Disconnected -> Reconnecting -> Streaming   (resume)
//! any state  -> Failed
//! ```
//!
//! Wire format (all integers little-endian): the opening command is a
//! `u32`-length-prefixed string; the reply header carries block size
//! (`0xFFFFFFFF` = error + ASCII reason), drive size, block count, a
//! persistency flag, the shadow-copy name and id, and optionally a
//! SHA-256 over the header. The stream is a sequence of frames keyed by
//! an `i64`: a non-negative key is a block index followed by one block
//! of payload; `-123` ends the stream, `-124` reports a remote error,
//! `-125` is a ping, `-126` carries a cumulative checksum to verify.

use std::convert::TryInto;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error as AnyError;
use log::{debug, error, info, warn};
use thiserror::Error;

use super::catalog::{add_log, BackupDao, Catalog};
use super::cleanup::CleanupController;
use super::status::{ProcessAction, ServerStatus};
use crate::backup::{
    generate_mbr, zero_block_digest, HashFile, ImageWriter, RollingDigest, VhdFile,
    ALLOC_BLOCK_SIZE, MBR_AREA_SIZE, SHA_SIZE,
};
use crate::config::ServerSettings;
use crate::tools;

const IMAGE_TIMEOUT: Duration = Duration::from_secs(10 * 24 * 60 * 60);
const RECV_TIMEOUT_FIRST: Duration = Duration::from_secs(30 * 60);
const RECV_TIMEOUT_AFTER_FIRST: Duration = Duration::from_secs(2 * 60);
const RECONNECT_WAIT: Duration = Duration::from_secs(60);
const MAX_HASH_ERRORS: u32 = 10;
const STATUS_UPDATE_INTERVAL_MS: i64 = 1000;
const ETA_UPDATE_INTERVAL_MS: i64 = 60_000;

const FRAME_END: i64 = -123;
const FRAME_ERROR: i64 = -124;
const FRAME_PING: i64 = -125;
const FRAME_CHECKSUM: i64 = -126;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("client reported an error: {0}")]
    RemoteAborted(String),
    #[error("checksum mismatch on the image block stream")]
    ChecksumMismatch,
    #[error("parent image for incremental backup is missing: {0}")]
    ParentMissing(String),
    #[error("not enough free space on the backup storage")]
    QuotaExceeded,
    #[error("server admin stopped the backup")]
    Stopped,
    #[error("timeout while transferring image data")]
    Timeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("image storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] AnyError),
}

impl From<crate::backup::VhdError> for ImageError {
    fn from(err: crate::backup::VhdError) -> Self {
        ImageError::Storage(err.to_string())
    }
}

impl From<crate::backup::HashFileError> for ImageError {
    fn from(err: crate::backup::HashFileError) -> Self {
        ImageError::Storage(err.to_string())
    }
}

/// Authenticated byte stream to one client, as produced by the session
/// layer. The engine only needs blocking reads/writes and a settable
/// read timeout.
pub trait ClientStream: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ClientStream for std::net::TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, timeout)
    }
}

/// Session provider: yields authenticated streams and the client's MBR.
pub trait ClientConnector: Send + Sync {
    fn connect(&self, clientname: &str) -> Result<Box<dyn ClientStream>, AnyError>;
    fn fetch_mbr(&self, clientname: &str, volume: &str) -> Result<Vec<u8>, AnyError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageMode {
    Full,
    Incr,
}

#[derive(Debug, Clone)]
pub struct ImageBackupRequest {
    pub clientname: String,
    pub letter: String,
    pub mode: ImageMode,
    pub with_checksum: bool,
}

pub struct ImageBackupEngine {
    catalog: Catalog,
    connector: Arc<dyn ClientConnector>,
    cleanup: Option<Arc<CleanupController>>,
    server_token: String,
}

impl ImageBackupEngine {
    pub fn new(
        catalog: Catalog,
        connector: Arc<dyn ClientConnector>,
        cleanup: Option<Arc<CleanupController>>,
        server_token: String,
    ) -> Self {
        Self {
            catalog,
            connector,
            cleanup,
            server_token,
        }
    }

    /// Run one image backup to completion. Returns the image backup id.
    pub fn begin_image(&self, request: ImageBackupRequest) -> Result<i64, ImageError> {
        let conn = self.catalog.connect().map_err(ImageError::Other)?;
        let mut transfer = Transfer::prepare(self, &request, conn)?;
        let result = transfer.run();
        transfer.finish(&result);
        result
    }
}

enum State {
    Connecting,
    Negotiating,
    Streaming,
    Reconnecting,
    Completing,
    Done,
}

struct Transfer<'a> {
    engine: &'a ImageBackupEngine,
    request: &'a ImageBackupRequest,
    conn: rusqlite::Connection,
    settings: ServerSettings,

    clientid: i64,
    backupid: i64,
    image_path: PathBuf,
    parent: Option<ParentImage>,

    stream: Option<BufReader<Box<dyn ClientStream>>>,
    writer: Option<ImageWriter>,
    hashes: Option<HashFile>,

    // negotiated values
    blocksize: u32,
    drive_size: i64,
    used_blocks: i64,
    total_blocks: i64,
    blocks_per_alloc: i64,
    persistent: bool,
    shadowdrive: String,
    shadow_id: i32,

    // streaming state
    next_block: i64,
    last_verified_block: i64,
    num_blocks_written: i64,
    num_hash_errors: u32,
    rolling: RollingDigest,
    verify_checksum: [u8; 32],
    warned_about_parent_hash: bool,
    warned_about_resent_block: bool,
    transferred_bytes: i64,

    // progress
    process_id: u64,
    transfer_start_ms: i64,
    last_status_update_ms: i64,
    last_eta_update_ms: i64,
    last_eta_blocks: i64,
    eta_set_time_ms: i64,
    eta_estimated_speed: f64,
}

struct ParentImage {
    id: i64,
    path: PathBuf,
    hashes: HashFile,
}

impl<'a> Transfer<'a> {
    fn prepare(
        engine: &'a ImageBackupEngine,
        request: &'a ImageBackupRequest,
        conn: rusqlite::Connection,
    ) -> Result<Self, ImageError> {
        let dao = BackupDao::new(&conn);
        let clientid = dao
            .get_or_create_client(&request.clientname)
            .map_err(ImageError::Other)?;
        let settings = ServerSettings::load(&conn, clientid).map_err(ImageError::Other)?;

        // incremental transfers need their parent before any byte moves
        let (parent, incremental) = match request.mode {
            ImageMode::Full => (None, 0),
            ImageMode::Incr => {
                let parent_row = dao
                    .find_last_complete_image(clientid, &request.letter)
                    .map_err(ImageError::Other)?
                    .ok_or_else(|| {
                        ImageError::ParentMissing(format!(
                            "no complete image of volume {} for client \"{}\"",
                            request.letter, request.clientname
                        ))
                    })?;
                let parent_path = PathBuf::from(&parent_row.path);
                let hash_path = sidecar(&parent_path, ".hash");
                let hashes = HashFile::open_readonly(&hash_path).map_err(|err| {
                    ImageError::ParentMissing(format!(
                        "unable to open parent hash sidecar {:?} - {}",
                        hash_path, err
                    ))
                })?;
                (
                    Some(ParentImage {
                        id: parent_row.id,
                        path: parent_path,
                        hashes,
                    }),
                    parent_row.incremental + 1,
                )
            }
        };

        let dir_name = tools::image_dir_name(&request.letter, chrono::Local::now());
        let client_dir = settings.backupfolder.join(&request.clientname);
        let mut image_dir = client_dir.join(&dir_name);
        let mut suffix = 0;
        while image_dir.exists() {
            suffix += 1;
            image_dir = client_dir.join(format!("{}_{}", dir_name, suffix));
        }
        std::fs::create_dir_all(&image_dir).map_err(ImageError::Io)?;
        let extension = if settings.image_compress { "vhdz" } else { "vhd" };
        let image_path = image_dir.join(format!("image.{}", extension));

        // free-space precheck; one cleanup attempt before giving up
        let free = tools::free_space(&settings.backupfolder).unwrap_or(i64::MAX);
        if free < settings.min_free_space {
            info!("not enough free space, cleaning up");
            let freed = engine
                .cleanup
                .as_ref()
                .map(|cleanup| cleanup.free_space(settings.min_free_space))
                .transpose()
                .map_err(ImageError::Other)?
                .unwrap_or(false);
            if !freed {
                error!("could not free space for the image backup");
                return Err(ImageError::QuotaExceeded);
            }
        }

        // the MBR blob captured from the client is required up front
        let mbr = engine
            .connector
            .fetch_mbr(&request.clientname, &request.letter)
            .map_err(ImageError::Other)?;
        if mbr.is_empty() {
            if request.letter != "SYSVOL" {
                return Err(ImageError::Protocol(
                    "client returned no MBR data".to_string(),
                ));
            }
        } else {
            std::fs::write(sidecar(&image_path, ".mbr"), &mbr).map_err(ImageError::Io)?;
        }

        // in-flight marker; removed only on clean completion
        std::fs::write(sidecar(&image_path, ".sync"), b"").map_err(ImageError::Io)?;

        let backupid = dao
            .create_image_backup(
                clientid,
                &request.letter,
                &image_path.to_string_lossy(),
                incremental,
                parent.as_ref().map(|parent| parent.id),
            )
            .map_err(ImageError::Other)?;

        let action = match request.mode {
            ImageMode::Full => ProcessAction::FullImage,
            ImageMode::Incr => ProcessAction::IncrImage,
        };
        let process_id =
            ServerStatus::start_process(&request.clientname, action, request.letter.clone());

        let now = tools::epoch_millis();
        Ok(Self {
            engine,
            request,
            conn,
            settings,
            clientid,
            backupid,
            image_path,
            parent,
            stream: None,
            writer: None,
            hashes: None,
            blocksize: 0,
            drive_size: 0,
            used_blocks: 0,
            total_blocks: 0,
            blocks_per_alloc: 0,
            persistent: false,
            shadowdrive: String::new(),
            shadow_id: -1,
            next_block: 0,
            last_verified_block: 0,
            num_blocks_written: 0,
            num_hash_errors: 0,
            rolling: RollingDigest::new(),
            verify_checksum: [0u8; 32],
            warned_about_parent_hash: false,
            warned_about_resent_block: false,
            transferred_bytes: 0,
            process_id,
            transfer_start_ms: now,
            last_status_update_ms: 0,
            last_eta_update_ms: 0,
            last_eta_blocks: 0,
            eta_set_time_ms: now,
            eta_estimated_speed: 0.0,
        })
    }

    fn run(&mut self) -> Result<i64, ImageError> {
        let mut state = State::Connecting;
        loop {
            self.check_stopped()?;
            self.check_deadline()?;
            state = match state {
                State::Connecting => {
                    self.connect(false)?;
                    State::Negotiating
                }
                State::Negotiating => {
                    self.negotiate()?;
                    State::Streaming
                }
                State::Streaming => self.stream_blocks()?,
                State::Reconnecting => {
                    self.reconnect()?;
                    State::Streaming
                }
                State::Completing => {
                    self.complete()?;
                    State::Done
                }
                State::Done => return Ok(self.backupid),
            };
        }
    }

    // ---- connection handling ---------------------------------------

    fn connect(&mut self, resume: bool) -> Result<(), ImageError> {
        let mut stream = self
            .engine
            .connector
            .connect(&self.request.clientname)
            .map_err(|err| {
                error!(
                    "connecting to client \"{}\" failed - {}",
                    self.request.clientname, err
                );
                ImageError::Other(err)
            })?;
        stream.set_read_timeout(Some(RECV_TIMEOUT_FIRST))?;

        let mut cmd = match self.request.mode {
            ImageMode::Full => format!(
                "FULL IMAGE letter={}&token={}",
                self.request.letter, self.engine.server_token
            ),
            ImageMode::Incr => {
                let hashsize = self
                    .parent
                    .as_ref()
                    .map(|parent| parent.hashes.byte_len())
                    .unwrap_or(0);
                format!(
                    "INCR IMAGE letter={}&hashsize={}&token={}",
                    self.request.letter, hashsize, self.engine.server_token
                )
            }
        };
        if self.request.with_checksum {
            cmd.push_str("&checksum=1");
        }
        if resume {
            let continue_block = (self.next_block / self.blocks_per_alloc) * self.blocks_per_alloc;
            cmd.push_str(&format!(
                "&shadowdrive={}&start={}&shadowid={}",
                self.shadowdrive, continue_block, self.shadow_id
            ));
        }

        let cmd_bytes = cmd.as_bytes();
        stream.write_all(&(cmd_bytes.len() as u32).to_le_bytes())?;
        stream.write_all(cmd_bytes)?;

        if self.request.mode == ImageMode::Incr {
            let parent = self.parent.as_ref().expect("incremental has a parent");
            let data = parent.hashes.read_all()?;
            stream.write_all(&data)?;
        }
        stream.flush()?;

        ServerStatus::set_online(&self.request.clientname, true);
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        ServerStatus::set_online(&self.request.clientname, false);
    }

    /// Disconnected: resume is only offered when the handshake
    /// advertised persistency and at least one block arrived.
    fn on_disconnect(&mut self, cause: ImageError) -> Result<State, ImageError> {
        self.drop_stream();
        if self.persistent && self.next_block != 0 {
            debug!("connection to \"{}\" lost, resuming", self.request.clientname);
            Ok(State::Reconnecting)
        } else {
            error!(
                "connection to \"{}\" unexpectedly closed - {}",
                self.request.clientname, cause
            );
            Err(cause)
        }
    }

    fn reconnect(&mut self) -> Result<(), ImageError> {
        loop {
            self.check_stopped()?;
            self.check_deadline()?;
            debug!("trying to reconnect to \"{}\"", self.request.clientname);
            match self.connect(true) {
                Ok(()) => {
                    debug!("reconnected");
                    self.set_stream_timeout(RECV_TIMEOUT_AFTER_FIRST)?;
                    return Ok(());
                }
                Err(_) => {
                    std::thread::sleep(RECONNECT_WAIT);
                }
            }
        }
    }

    fn set_stream_timeout(&mut self, timeout: Duration) -> Result<(), ImageError> {
        if let Some(stream) = self.stream.as_mut() {
            stream.get_mut().set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    // ---- header ----------------------------------------------------

    fn negotiate(&mut self) -> Result<(), ImageError> {
        let mut raw_header = Vec::with_capacity(64);

        let blocksize = {
            let mut buf = [0u8; 4];
            self.read_wire(&mut buf)?;
            raw_header.extend_from_slice(&buf);
            u32::from_le_bytes(buf)
        };

        if blocksize == 0xFFFF_FFFF {
            let reason = self.read_error_reason();
            error!("image backup request failed, reason: {}", reason);
            return Err(ImageError::RemoteAborted(reason));
        }
        if blocksize < 512
            || blocksize as u64 > ALLOC_BLOCK_SIZE
            || ALLOC_BLOCK_SIZE % blocksize as u64 != 0
        {
            return Err(ImageError::Protocol(format!(
                "unusable client block size {}",
                blocksize
            )));
        }

        let drive_size = self.read_wire_i64(&mut raw_header)?;
        let used_blocks = self.read_wire_i64(&mut raw_header)?;
        let persistent = {
            let mut buf = [0u8; 1];
            self.read_wire(&mut buf)?;
            raw_header.extend_from_slice(&buf);
            buf[0] != 0
        };
        let shadowdrive = {
            let mut buf = [0u8; 4];
            self.read_wire(&mut buf)?;
            raw_header.extend_from_slice(&buf);
            let len = u32::from_le_bytes(buf) as usize;
            if len > 4096 {
                return Err(ImageError::Protocol("shadow drive name too long".into()));
            }
            let mut name = vec![0u8; len];
            self.read_wire(&mut name)?;
            raw_header.extend_from_slice(&name);
            String::from_utf8_lossy(&name).into_owned()
        };
        let shadow_id = {
            let mut buf = [0u8; 4];
            self.read_wire(&mut buf)?;
            raw_header.extend_from_slice(&buf);
            i32::from_le_bytes(buf)
        };

        if self.request.with_checksum {
            let mut digest = [0u8; SHA_SIZE];
            self.read_wire(&mut digest)?;
            if openssl::sha::sha256(&raw_header) != digest {
                error!("checksum of the first packet is wrong, stopping image backup");
                return Err(ImageError::ChecksumMismatch);
            }
        }

        if drive_size < 0 {
            return Err(ImageError::Protocol(format!(
                "negative drive size {}",
                drive_size
            )));
        }

        self.blocksize = blocksize;
        self.drive_size = drive_size;
        self.used_blocks = used_blocks;
        self.blocks_per_alloc = (ALLOC_BLOCK_SIZE / blocksize as u64) as i64;
        self.total_blocks = drive_size / blocksize as i64
            + if drive_size % blocksize as i64 != 0 { 1 } else { 0 };
        self.persistent = persistent;
        self.shadowdrive = shadowdrive;
        self.shadow_id = shadow_id;

        self.open_storage()?;
        self.set_stream_timeout(RECV_TIMEOUT_AFTER_FIRST)?;
        Ok(())
    }

    fn open_storage(&mut self) -> Result<(), ImageError> {
        let logical_size =
            MBR_AREA_SIZE + round_up(self.drive_size as u64, ALLOC_BLOCK_SIZE);

        let container = match &self.parent {
            None => VhdFile::create(
                &self.image_path,
                logical_size,
                ALLOC_BLOCK_SIZE as u32,
                self.settings.image_compress,
            )?,
            Some(parent) => {
                VhdFile::create_diff(&self.image_path, &parent.path, self.settings.image_compress)
                    .map_err(|err| match err {
                        crate::backup::VhdError::ParentMissing(_, reason) => {
                            ImageError::ParentMissing(reason)
                        }
                        other => other.into(),
                    })?
            }
        };

        let writer = ImageWriter::new(container, self.blocksize as usize);

        // generated MBR sector at the container start
        let mut buf = writer.get_buffer();
        buf.iter_mut().for_each(|byte| *byte = 0);
        let mbr = generate_mbr(self.drive_size as u64);
        buf[..mbr.len()].copy_from_slice(&mbr);
        writer.submit(0, buf);

        self.writer = Some(writer);
        self.hashes = Some(HashFile::create(&sidecar(&self.image_path, ".hash"))?);
        Ok(())
    }

    // ---- streaming -------------------------------------------------

    fn stream_blocks(&mut self) -> Result<State, ImageError> {
        loop {
            self.check_stopped()?;
            self.check_deadline()?;

            let mut key_buf = [0u8; 8];
            match self.read_wire(&mut key_buf) {
                Ok(()) => {}
                Err(err) => return self.on_disconnect(err),
            }
            let key = i64::from_le_bytes(key_buf);

            if key >= 0 || key as u64 == u64::MAX {
                if key as u64 == u64::MAX {
                    let reason = self.read_error_reason();
                    error!("error on client occurred: {}", reason);
                    self.abort_writer();
                    return Err(ImageError::RemoteAborted(reason));
                }
                match self.receive_block(key) {
                    Ok(()) => {}
                    // only transport failures are resumable
                    Err(err @ ImageError::Io(_)) | Err(err @ ImageError::Timeout) => {
                        return self.on_disconnect(err)
                    }
                    Err(err) => return Err(err),
                }
            } else {
                match key {
                    FRAME_END => return Ok(State::Completing),
                    FRAME_ERROR => {
                        let reason = self.read_error_reason();
                        error!("error on client occurred: {}", reason);
                        self.abort_writer();
                        return Err(ImageError::RemoteAborted(reason));
                    }
                    FRAME_PING => {}
                    FRAME_CHECKSUM => match self.receive_checksum()? {
                        Some(state) => return Ok(state),
                        None => {}
                    },
                    other => {
                        return Err(ImageError::Protocol(format!(
                            "unknown frame key {}",
                            other
                        )))
                    }
                }
            }
        }
    }

    fn receive_block(&mut self, block_index: i64) -> Result<(), ImageError> {
        if block_index >= self.total_blocks {
            return Err(ImageError::Protocol(format!(
                "block index {} beyond the volume end ({} blocks)",
                block_index, self.total_blocks
            )));
        }

        let mut buf = match self.writer.as_ref() {
            Some(writer) => writer.get_buffer(),
            None => return Err(ImageError::Protocol("no image writer".to_string())),
        };
        if let Err(err) = self.read_wire(&mut buf) {
            if let Some(writer) = self.writer.as_ref() {
                writer.return_buffer(buf);
            }
            return Err(err);
        }
        self.transferred_bytes += self.blocksize as i64 + 8;

        if block_index < self.next_block {
            // retransmission of an already-hashed block: keep the newer
            // bytes, the rolling hash already covers this range
            if !self.warned_about_resent_block {
                debug!(
                    "client resent block {} below the current position {}",
                    block_index, self.next_block
                );
                self.warned_about_resent_block = true;
            }
            self.submit_block(block_index, buf);
            return Ok(());
        }

        self.num_blocks_written += 1;
        self.update_progress(block_index);

        self.advance_to(block_index)?;
        self.rolling.update(&buf);
        self.submit_block(block_index, buf);
        self.next_block = block_index + 1;

        if self.next_block % self.blocks_per_alloc == 0 {
            let digest = self.rolling.finish_reset();
            self.write_hash(self.next_block / self.blocks_per_alloc - 1, &digest)?;
        }

        if self.writer_had_error() {
            error!("FATAL: could not write to the image container");
            self.engine_notify("Fatal error during image backup");
            return Err(ImageError::Storage("image writer failed".to_string()));
        }

        Ok(())
    }

    fn submit_block(&self, block_index: i64, buf: crate::backup::OwnedBlock) {
        if let Some(writer) = self.writer.as_ref() {
            writer.submit(
                MBR_AREA_SIZE + block_index as u64 * self.blocksize as u64,
                buf,
            );
        }
    }

    fn writer_had_error(&self) -> bool {
        self.writer
            .as_ref()
            .map(|writer| writer.had_error())
            .unwrap_or(true)
    }

    /// Zero-pad the rolling hash across a gap in the block stream, and
    /// emit whole-allocation-block digests for fully skipped ranges
    /// (zero digest for full images, the parent's digest for
    /// incrementals).
    fn advance_to(&mut self, currblock: i64) -> Result<(), ImageError> {
        if self.next_block >= currblock {
            return Ok(());
        }

        let zero_block = vec![0u8; self.blocksize as usize];

        if currblock - self.next_block >= self.blocks_per_alloc {
            // finish the partially hashed allocation block first
            if self.next_block % self.blocks_per_alloc != 0 {
                loop {
                    self.rolling.update(&zero_block);
                    self.next_block += 1;
                    if self.next_block % self.blocks_per_alloc == 0 {
                        let digest = self.rolling.finish_reset();
                        self.write_hash(self.next_block / self.blocks_per_alloc - 1, &digest)?;
                        break;
                    }
                }
            }

            while currblock - self.next_block >= self.blocks_per_alloc {
                let digest = self.skipped_alloc_digest()?;
                self.write_hash(self.next_block / self.blocks_per_alloc, &digest)?;
                self.next_block += self.blocks_per_alloc;
            }
        }

        while self.next_block < currblock {
            self.rolling.update(&zero_block);
            self.next_block += 1;
            if self.next_block % self.blocks_per_alloc == 0 {
                let digest = self.rolling.finish_reset();
                self.write_hash(self.next_block / self.blocks_per_alloc - 1, &digest)?;
            }
        }
        Ok(())
    }

    /// Zero-pad the trailing allocation block up to its boundary; the
    /// block digests always cover whole allocation blocks.
    fn pad_to_boundary(&mut self) {
        if self.next_block % self.blocks_per_alloc == 0 {
            return;
        }
        let zero_block = vec![0u8; self.blocksize as usize];
        while self.next_block % self.blocks_per_alloc != 0 {
            self.rolling.update(&zero_block);
            self.next_block += 1;
        }
    }

    /// Digest for an allocation block the client skipped entirely.
    fn skipped_alloc_digest(&mut self) -> Result<[u8; 32], ImageError> {
        let index = (self.next_block / self.blocks_per_alloc) as u64;
        match &self.parent {
            None => Ok(zero_block_digest(ALLOC_BLOCK_SIZE)),
            Some(parent) => match parent.hashes.digest_at(index) {
                Ok(digest) => Ok(digest),
                Err(_) => {
                    if !self.warned_about_parent_hash {
                        warn!(
                            "reading from the parent hash sidecar failed (volume may have grown)"
                        );
                        self.warned_about_parent_hash = true;
                    }
                    Ok(zero_block_digest(ALLOC_BLOCK_SIZE))
                }
            },
        }
    }

    fn write_hash(&mut self, index: i64, digest: &[u8; 32]) -> Result<(), ImageError> {
        let hashes = self
            .hashes
            .as_mut()
            .ok_or_else(|| ImageError::Protocol("no hash sidecar".to_string()))?;
        hashes.write_digest_at(index as u64, digest)?;
        self.verify_checksum = *digest;
        Ok(())
    }

    fn receive_checksum(&mut self) -> Result<Option<State>, ImageError> {
        let mut buf = [0u8; 8 + SHA_SIZE];
        self.read_wire(&mut buf)?;
        let verify_up_to = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let mut digest = [0u8; SHA_SIZE];
        digest.copy_from_slice(&buf[8..]);

        let blocks = self.drive_size / self.blocksize as i64;
        if (self.next_block < verify_up_to || verify_up_to == blocks) && verify_up_to > 0 {
            if self.next_block < verify_up_to {
                // zero-pad up to the verify point; boundary digests are
                // written along the way
                self.advance_to(verify_up_to)?;
            }
            if verify_up_to == blocks && self.next_block % self.blocks_per_alloc != 0 {
                // final, partial allocation block: digests cover whole
                // allocation blocks, so pad before finishing
                self.pad_to_boundary();
                let final_digest = self.rolling.finish_reset();
                self.write_hash(self.next_block / self.blocks_per_alloc - 1, &final_digest)?;
            }
        }

        if digest != self.verify_checksum {
            debug!(
                "client hash={} server hash={} verify_up_to={}",
                tools::digest_to_hex(&digest),
                tools::digest_to_hex(&self.verify_checksum),
                verify_up_to
            );
            if self.num_hash_errors < MAX_HASH_ERRORS {
                self.num_hash_errors += 1;
                warn!("checksum for image block wrong, retrying");
                self.drop_stream();
                // restart the stream at the last verified boundary
                self.next_block = self.last_verified_block;
                self.rolling = RollingDigest::new();
                return Ok(Some(State::Reconnecting));
            }
            error!("checksum for image block wrong, stopping image backup");
            self.abort_writer();
            return Err(ImageError::ChecksumMismatch);
        }

        self.last_verified_block = if verify_up_to >= self.blocks_per_alloc {
            verify_up_to - self.blocks_per_alloc
        } else {
            verify_up_to
        };
        Ok(None)
    }

    // ---- completion ------------------------------------------------

    fn complete(&mut self) -> Result<(), ImageError> {
        // pad the tail with zero blocks and flush the final digest
        if self.next_block < self.total_blocks {
            self.advance_to(self.total_blocks)?;
        }
        if self.next_block % self.blocks_per_alloc != 0 {
            self.pad_to_boundary();
            let digest = self.rolling.finish_reset();
            self.write_hash(self.next_block / self.blocks_per_alloc - 1, &digest)?;
        }

        self.drop_stream();

        let writer = self.writer.take().expect("writer open at completion");
        let mut container = writer
            .shutdown()
            .map_err(|err| ImageError::Storage(err.to_string()))?;

        let mut hashes = self.hashes.take().expect("hash sidecar open at completion");
        hashes.sync()?;
        let expected = HashFile::expected_count(self.drive_size as u64, ALLOC_BLOCK_SIZE);
        if hashes.digest_count() != expected {
            return Err(ImageError::Storage(format!(
                "hash sidecar holds {} digests, expected {}",
                hashes.digest_count(),
                expected
            )));
        }

        let size = container
            .physical_size()
            .map_err(|err| ImageError::Storage(err.to_string()))?;
        container.close().map_err(|err| ImageError::Storage(err.to_string()))?;

        let dao = BackupDao::new(&self.conn);
        dao.finish_image_backup(self.backupid, size as i64)
            .map_err(ImageError::Other)?;

        let _ = std::fs::remove_file(sidecar(&self.image_path, ".sync"));

        let passed_ms = (tools::epoch_millis() - self.transfer_start_ms).max(1);
        info!(
            "transferred {} - average speed: {}",
            tools::pretty_print_bytes(self.transferred_bytes),
            tools::pretty_print_speed(self.transferred_bytes * 1000 / passed_ms)
        );
        Ok(())
    }

    /// Final bookkeeping for both outcomes; called exactly once.
    fn finish(&mut self, result: &Result<i64, ImageError>) {
        if let Some(writer) = self.writer.take() {
            writer.exit_now();
        }
        self.drop_stream();

        let success = result.is_ok();
        let dao = BackupDao::new(&self.conn);
        let action = match self.request.mode {
            ImageMode::Full => "full_image",
            ImageMode::Incr => "incr_image",
        };
        if let Err(err) = dao.add_processes_log(
            self.clientid,
            action,
            &self.request.letter,
            self.transfer_start_ms / 1000,
            success,
        ) {
            warn!("unable to write the processes log - {}", err);
        }
        if let Err(err) = result {
            let _ = add_log(
                &self.conn,
                self.clientid,
                Some(self.backupid),
                2,
                &format!("image backup failed: {}", err),
            );
        }
        ServerStatus::stop_process(&self.request.clientname, self.process_id);
        ServerStatus::clear_stopped(&self.request.clientname);
    }

    fn abort_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.exit_now();
        }
    }

    // ---- helpers ---------------------------------------------------

    fn check_stopped(&mut self) -> Result<(), ImageError> {
        if ServerStatus::is_backup_stopped(&self.request.clientname) {
            error!("server admin stopped backup");
            self.abort_writer();
            return Err(ImageError::Stopped);
        }
        Ok(())
    }

    fn check_deadline(&mut self) -> Result<(), ImageError> {
        let passed = tools::epoch_millis() - self.transfer_start_ms;
        if passed > IMAGE_TIMEOUT.as_millis() as i64 {
            self.abort_writer();
            return Err(ImageError::Timeout);
        }
        Ok(())
    }

    fn read_wire(&mut self, buf: &mut [u8]) -> Result<(), ImageError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ImageError::Protocol("no connection".to_string()))?;
        stream.read_exact(buf).map_err(|err| match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ImageError::Timeout,
            _ => ImageError::Io(err),
        })
    }

    fn read_wire_i64(&mut self, raw: &mut Vec<u8>) -> Result<i64, ImageError> {
        let mut buf = [0u8; 8];
        self.read_wire(&mut buf)?;
        raw.extend_from_slice(&buf);
        Ok(i64::from_le_bytes(buf))
    }

    /// Best-effort read of a trailing error message; the reason ends at
    /// a `|#|` delimiter or the end of what the client sent.
    fn read_error_reason(&mut self) -> String {
        let mut raw = Vec::new();
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream
                .get_mut()
                .set_read_timeout(Some(Duration::from_secs(5)));
            let mut buf = [0u8; 4096];
            if let Ok(n) = stream.read(&mut buf) {
                raw.extend_from_slice(&buf[..n]);
            }
        }
        if raw.is_empty() {
            return "no reason given".to_string();
        }
        let text = String::from_utf8_lossy(&raw);
        match text.find("|#|") {
            Some(pos) => text[..pos].to_string(),
            None => text.trim_end_matches('\n').to_string(),
        }
    }

    fn engine_notify(&self, subject: &str) {
        if let Some(cleanup) = &self.engine.cleanup {
            cleanup.notify_admins(subject, "A fatal error occurred during an image backup.");
        }
    }

    fn update_progress(&mut self, currblock: i64) {
        let now = tools::epoch_millis();
        if now - self.last_status_update_ms > STATUS_UPDATE_INTERVAL_MS {
            self.last_status_update_ms = now;

            if self.used_blocks != 0 {
                let pcdone = if self.parent.is_some() {
                    (currblock as f64 / self.total_blocks.max(1) as f64 * 100.0 + 0.5) as i32
                } else {
                    (self.num_blocks_written as f64 / self.used_blocks as f64 * 100.0 + 0.5) as i32
                };
                ServerStatus::set_process_pcdone(
                    &self.request.clientname,
                    self.process_id,
                    pcdone.min(100),
                );
                ServerStatus::set_process_done_bytes(
                    &self.request.clientname,
                    self.process_id,
                    self.transferred_bytes,
                    self.drive_size,
                );
            }

            let dao = BackupDao::new(&self.conn);
            let _ = dao.update_image_running(self.backupid);
        }

        if now - self.last_eta_update_ms > ETA_UPDATE_INTERVAL_MS && self.used_blocks != 0 {
            self.last_eta_update_ms = now;

            let rel_blocks = if self.parent.is_some() {
                currblock
            } else {
                self.num_blocks_written
            };
            let new_blocks = rel_blocks - self.last_eta_blocks;
            if new_blocks > 0 {
                self.last_eta_blocks = rel_blocks;
                let passed = (now - self.eta_set_time_ms).max(1);
                self.eta_set_time_ms = now;

                let speed_bpms = new_blocks as f64 / passed as f64;
                if self.eta_estimated_speed == 0.0 {
                    self.eta_estimated_speed = speed_bpms;
                } else {
                    self.eta_estimated_speed = 0.9 * self.eta_estimated_speed + 0.1 * speed_bpms;
                }

                let remaining = if self.parent.is_some() {
                    self.total_blocks - rel_blocks
                } else {
                    self.used_blocks - rel_blocks
                };
                let eta_ms = (remaining as f64 / self.eta_estimated_speed + 0.5) as i64;
                ServerStatus::set_process_eta(
                    &self.request.clientname,
                    self.process_id,
                    eta_ms,
                    self.eta_estimated_speed,
                );
            }
        }
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}
