//! End-to-end image transfer scenarios against a scripted client.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::sha::sha256;

use blockbackup::backup::{
    zero_block_digest, HashFile, OpenMode, VhdFile, ALLOC_BLOCK_SIZE, MBR_AREA_SIZE,
};
use blockbackup::config::ServerSettings;
use blockbackup::server::catalog::{Catalog, CATALOG_DB_NAME};
use blockbackup::server::{
    ClientConnector, ClientStream, ImageBackupEngine, ImageBackupRequest, ImageError, ImageMode,
};

// ---- scripted client ----------------------------------------------

struct ScriptedStream {
    data: io::Cursor<Vec<u8>>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ClientStream for ScriptedStream {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<u8>>>,
    mbr: Vec<u8>,
    /// Everything the engine sent, one buffer per connection.
    sent: Mutex<Vec<Arc<Mutex<Vec<u8>>>>>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            mbr: vec![0xfa; 512],
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent_text(&self, connection: usize) -> String {
        let sent = self.sent.lock().unwrap();
        let guard = sent[connection].lock().unwrap();
        String::from_utf8_lossy(&guard).into_owned()
    }

    fn connections(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl ClientConnector for ScriptedConnector {
    fn connect(&self, _clientname: &str) -> Result<Box<dyn ClientStream>, anyhow::Error> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::format_err!("no more scripted connections"))?;
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.sent.lock().unwrap().push(Arc::clone(&sent));
        Ok(Box::new(ScriptedStream {
            data: io::Cursor::new(script),
            sent,
        }))
    }

    fn fetch_mbr(&self, _clientname: &str, _volume: &str) -> Result<Vec<u8>, anyhow::Error> {
        Ok(self.mbr.clone())
    }
}

// ---- wire building blocks -----------------------------------------

fn header(
    blocksize: u32,
    drive_size: i64,
    blockcnt: i64,
    persistent: bool,
    with_checksum: bool,
) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&blocksize.to_le_bytes());
    raw.extend_from_slice(&drive_size.to_le_bytes());
    raw.extend_from_slice(&blockcnt.to_le_bytes());
    raw.push(persistent as u8);
    let shadowdrive = b"\\\\?\\GLOBALROOT\\Device\\HarddiskVolumeShadowCopy1";
    raw.extend_from_slice(&(shadowdrive.len() as u32).to_le_bytes());
    raw.extend_from_slice(shadowdrive);
    raw.extend_from_slice(&7i32.to_le_bytes());
    if with_checksum {
        let digest = sha256(&raw);
        raw.extend_from_slice(&digest);
    }
    raw
}

fn block_frame(index: i64, data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + data.len());
    raw.extend_from_slice(&index.to_le_bytes());
    raw.extend_from_slice(data);
    raw
}

fn checksum_frame(verify_up_to: i64, digest: &[u8; 32]) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&(-126i64).to_le_bytes());
    raw.extend_from_slice(&verify_up_to.to_le_bytes());
    raw.extend_from_slice(digest);
    raw
}

fn ping_frame() -> Vec<u8> {
    (-125i64).to_le_bytes().to_vec()
}

fn end_frame() -> Vec<u8> {
    (-123i64).to_le_bytes().to_vec()
}

fn pattern_block(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect()
}

// ---- test setup ----------------------------------------------------

struct Setup {
    _dir: tempfile::TempDir,
    catalog: Catalog,
    backupfolder: PathBuf,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(&dir.path().join(CATALOG_DB_NAME)).unwrap();
    let backupfolder = dir.path().join("backups");
    std::fs::create_dir_all(&backupfolder).unwrap();

    let conn = catalog.connect().unwrap();
    ServerSettings::set(&conn, 0, "backupfolder", backupfolder.to_str().unwrap()).unwrap();
    ServerSettings::set(&conn, 0, "image_compress", "false").unwrap();
    ServerSettings::set(&conn, 0, "min_free_space", "0").unwrap();

    Setup {
        _dir: dir,
        catalog,
        backupfolder,
    }
}

fn engine(setup: &Setup, connector: Arc<ScriptedConnector>) -> ImageBackupEngine {
    ImageBackupEngine::new(
        setup.catalog.clone(),
        connector,
        None,
        "token123".to_string(),
    )
}

fn image_row(setup: &Setup, backupid: i64) -> (String, bool, i64) {
    let conn = setup.catalog.connect().unwrap();
    conn.query_row(
        "SELECT path, complete, size_bytes FROM backup_images WHERE id=?",
        rusqlite::params![backupid],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get(2)?,
            ))
        },
    )
    .unwrap()
}

fn read_volume_block(image_path: &str, index: u64, len: usize) -> Vec<u8> {
    let mut vhd = VhdFile::open(Path::new(image_path), OpenMode::Read).unwrap();
    let mut buf = vec![0u8; len];
    vhd.read(MBR_AREA_SIZE + index * ALLOC_BLOCK_SIZE, &mut buf)
        .unwrap();
    buf
}

// ---- scenarios -----------------------------------------------------

/// Full image, three allocation blocks, block 1 never sent: its digest
/// is the canonical zero digest and it reads back as zeroes.
#[test]
fn full_image_with_zero_run() {
    let setup = setup();

    let blocksize = ALLOC_BLOCK_SIZE as u32;
    let drive_size = 3 * ALLOC_BLOCK_SIZE as i64;
    let block0 = pattern_block(blocksize as usize, 1);
    let block2 = pattern_block(blocksize as usize, 2);

    let mut script = header(blocksize, drive_size, 2, false, false);
    script.extend(block_frame(0, &block0));
    script.extend(ping_frame());
    script.extend(block_frame(2, &block2));
    script.extend(end_frame());

    let connector = ScriptedConnector::new(vec![script]);
    let backupid = engine(&setup, Arc::clone(&connector))
        .begin_image(ImageBackupRequest {
            clientname: "testclient".to_string(),
            letter: "C".to_string(),
            mode: ImageMode::Full,
            with_checksum: false,
        })
        .unwrap();

    let (path, complete, size) = image_row(&setup, backupid);
    assert!(complete);

    // the recorded size is the container's physical size
    let meta = std::fs::metadata(&path).unwrap();
    assert_eq!(size, meta.len() as i64);

    // hash sidecar: exactly 3 x 32 bytes, zero digest at offset 32
    let hashes = HashFile::open_readonly(&PathBuf::from(format!("{}.hash", path))).unwrap();
    assert_eq!(hashes.byte_len(), 3 * 32);
    assert_eq!(hashes.digest_at(0).unwrap(), sha256(&block0));
    assert_eq!(
        hashes.digest_at(1).unwrap(),
        zero_block_digest(ALLOC_BLOCK_SIZE)
    );
    assert_eq!(hashes.digest_at(2).unwrap(), sha256(&block2));

    // every non-zero block reads back byte-identically
    assert_eq!(read_volume_block(&path, 0, block0.len()), block0);
    assert_eq!(read_volume_block(&path, 2, block2.len()), block2);
    assert!(read_volume_block(&path, 1, blocksize as usize)
        .iter()
        .all(|&b| b == 0));

    // generated MBR sector at the container start
    let mut vhd = VhdFile::open(Path::new(&path), OpenMode::Read).unwrap();
    let mut mbr = vec![0u8; 512];
    vhd.read(0, &mut mbr).unwrap();
    assert_eq!(&mbr[510..512], &[0x55, 0xaa]);

    // the captured client MBR landed in the sidecar
    let mbr_blob = std::fs::read(format!("{}.mbr", path)).unwrap();
    assert_eq!(mbr_blob, vec![0xfa; 512]);

    // the command carried letter and token
    let cmd = connector.sent_text(0);
    assert!(cmd.contains("FULL IMAGE letter=C&token=token123"));

    // in-flight marker removed on completion
    assert!(!PathBuf::from(format!("{}.sync", path)).exists());
}

/// Incremental over the full image: unsent blocks fall through to the
/// parent, the sidecar is fully populated from the parent's digests.
#[test]
fn incremental_reads_through_to_parent() {
    let setup = setup();
    let blocksize = ALLOC_BLOCK_SIZE as u32;
    let drive_size = 3 * ALLOC_BLOCK_SIZE as i64;
    let block0 = pattern_block(blocksize as usize, 1);
    let block2 = pattern_block(blocksize as usize, 2);

    // full backup first
    let mut script = header(blocksize, drive_size, 2, false, false);
    script.extend(block_frame(0, &block0));
    script.extend(block_frame(2, &block2));
    script.extend(end_frame());
    let connector = ScriptedConnector::new(vec![script]);
    let full_id = engine(&setup, connector)
        .begin_image(ImageBackupRequest {
            clientname: "testclient".to_string(),
            letter: "C".to_string(),
            mode: ImageMode::Full,
            with_checksum: false,
        })
        .unwrap();
    let (full_path, _, _) = image_row(&setup, full_id);

    // incremental: only block 2 changes
    let new_block2 = pattern_block(blocksize as usize, 9);
    let mut script = header(blocksize, drive_size, 1, false, false);
    script.extend(block_frame(2, &new_block2));
    script.extend(end_frame());
    let connector = ScriptedConnector::new(vec![script]);
    let incr_id = engine(&setup, Arc::clone(&connector))
        .begin_image(ImageBackupRequest {
            clientname: "testclient".to_string(),
            letter: "C".to_string(),
            mode: ImageMode::Incr,
            with_checksum: false,
        })
        .unwrap();

    let (incr_path, complete, _) = image_row(&setup, incr_id);
    assert!(complete);
    assert_ne!(incr_path, full_path);

    // parent pointer recorded
    let conn = setup.catalog.connect().unwrap();
    let parent_ref: i64 = conn
        .query_row(
            "SELECT incremental_ref FROM backup_images WHERE id=?",
            rusqlite::params![incr_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(parent_ref, full_id);

    // sidecar: parent digests for unchanged blocks, new digest for 2
    let full_hashes = HashFile::open_readonly(&PathBuf::from(format!("{}.hash", full_path))).unwrap();
    let incr_hashes = HashFile::open_readonly(&PathBuf::from(format!("{}.hash", incr_path))).unwrap();
    assert_eq!(incr_hashes.byte_len(), 3 * 32);
    assert_eq!(incr_hashes.digest_at(0).unwrap(), full_hashes.digest_at(0).unwrap());
    assert_eq!(incr_hashes.digest_at(1).unwrap(), full_hashes.digest_at(1).unwrap());
    assert_eq!(incr_hashes.digest_at(2).unwrap(), sha256(&new_block2));

    // reading unchanged data goes through to the parent container
    assert_eq!(read_volume_block(&incr_path, 0, block0.len()), block0);
    assert_eq!(read_volume_block(&incr_path, 2, new_block2.len()), new_block2);

    // the opening command announced the parent hash size
    let cmd = connector.sent_text(0);
    assert!(cmd.contains(&format!("INCR IMAGE letter=C&hashsize={}", 3 * 32)));
}

/// Checksum mismatch drops the connection and restarts the stream at
/// the last verified block; the image still completes with exactly one
/// catalog row.
#[test]
fn checksum_retry_restarts_streaming() {
    let setup = setup();
    let blocksize = ALLOC_BLOCK_SIZE as u32;
    let block_count: i64 = 16;
    let drive_size = block_count * ALLOC_BLOCK_SIZE as i64;

    let blocks: Vec<Vec<u8>> = (0..block_count)
        .map(|i| pattern_block(blocksize as usize, i as u8))
        .collect();

    // first connection: block 7 arrives corrupted, then the client's
    // checksum over the pristine data exposes the mismatch
    let mut corrupted = blocks[7].clone();
    corrupted[123] ^= 0xff;
    let mut script1 = header(blocksize, drive_size, block_count, true, true);
    for (i, block) in blocks.iter().enumerate().take(8) {
        if i == 7 {
            script1.extend(block_frame(7, &corrupted));
        } else {
            script1.extend(block_frame(i as i64, block));
        }
    }
    script1.extend(checksum_frame(8, &sha256(&blocks[7])));

    // second connection: resumed stream with pristine data
    let mut script2 = Vec::new();
    for (i, block) in blocks.iter().enumerate() {
        script2.extend(block_frame(i as i64, block));
    }
    script2.extend(checksum_frame(block_count, &sha256(&blocks[15])));
    script2.extend(end_frame());

    let connector = ScriptedConnector::new(vec![script1, script2]);
    let backupid = engine(&setup, Arc::clone(&connector))
        .begin_image(ImageBackupRequest {
            clientname: "testclient".to_string(),
            letter: "C".to_string(),
            mode: ImageMode::Full,
            with_checksum: true,
        })
        .unwrap();

    assert_eq!(connector.connections(), 2, "exactly one reconnect");
    let resume_cmd = connector.sent_text(1);
    assert!(resume_cmd.contains("&start=0&"), "resumes at the last verified block");
    assert!(resume_cmd.contains("&shadowdrive="));

    // exactly one image row, complete, with the container's size
    let conn = setup.catalog.connect().unwrap();
    let rows: i64 = conn
        .query_row(
            "SELECT count(*) FROM backup_images",
            rusqlite::params![],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rows, 1);

    let (path, complete, size) = image_row(&setup, backupid);
    assert!(complete);
    assert_eq!(size, std::fs::metadata(&path).unwrap().len() as i64);

    // the corrupted block was overwritten by the retry
    assert_eq!(read_volume_block(&path, 7, blocksize as usize), blocks[7]);

    let hashes = HashFile::open_readonly(&PathBuf::from(format!("{}.hash", path))).unwrap();
    assert_eq!(hashes.byte_len() as i64, block_count * 32);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(hashes.digest_at(i as u64).unwrap(), sha256(block));
    }
}

/// Builds the scripts for a run with `mismatches` consecutive checksum
/// failures on the first allocation block, optionally followed by one
/// clean connection that finishes the two-block transfer.
fn checksum_mismatch_scripts(
    block0: &[u8],
    block1: &[u8],
    mismatches: usize,
    then_succeed: bool,
) -> Vec<Vec<u8>> {
    let drive_size = 2 * ALLOC_BLOCK_SIZE as i64;
    let bad_digest = [0x5au8; 32];

    let mut scripts = Vec::new();
    for connection in 0..mismatches {
        let mut script = if connection == 0 {
            header(ALLOC_BLOCK_SIZE as u32, drive_size, 2, true, true)
        } else {
            Vec::new() // resumed connections skip the header
        };
        script.extend(block_frame(0, block0));
        script.extend(checksum_frame(1, &bad_digest));
        scripts.push(script);
    }

    if then_succeed {
        let mut script = Vec::new();
        script.extend(block_frame(0, block0));
        script.extend(block_frame(1, block1));
        script.extend(checksum_frame(2, &sha256(block1)));
        script.extend(end_frame());
        scripts.push(script);
    }
    scripts
}

/// Ten consecutive mismatches exhaust none of the retry budget: the
/// transfer completes after the tenth reconnect.
#[test]
fn ten_checksum_mismatches_still_complete() {
    let setup = setup();
    let block0 = pattern_block(ALLOC_BLOCK_SIZE as usize, 11);
    let block1 = pattern_block(ALLOC_BLOCK_SIZE as usize, 12);

    let connector =
        ScriptedConnector::new(checksum_mismatch_scripts(&block0, &block1, 10, true));
    let backupid = engine(&setup, Arc::clone(&connector))
        .begin_image(ImageBackupRequest {
            clientname: "testclient".to_string(),
            letter: "C".to_string(),
            mode: ImageMode::Full,
            with_checksum: true,
        })
        .unwrap();

    // ten mismatches, ten reconnects, then the clean connection
    assert_eq!(connector.connections(), 11);

    let (path, complete, _) = image_row(&setup, backupid);
    assert!(complete);
    assert_eq!(read_volume_block(&path, 0, block0.len()), block0);
    assert_eq!(read_volume_block(&path, 1, block1.len()), block1);

    let hashes = HashFile::open_readonly(&PathBuf::from(format!("{}.hash", path))).unwrap();
    assert_eq!(hashes.byte_len(), 2 * 32);
    assert_eq!(hashes.digest_at(0).unwrap(), sha256(&block0));
    assert_eq!(hashes.digest_at(1).unwrap(), sha256(&block1));
}

/// The eleventh consecutive mismatch is fatal.
#[test]
fn eleventh_checksum_mismatch_aborts() {
    let setup = setup();
    let block0 = pattern_block(ALLOC_BLOCK_SIZE as usize, 21);
    let block1 = pattern_block(ALLOC_BLOCK_SIZE as usize, 22);

    let connector =
        ScriptedConnector::new(checksum_mismatch_scripts(&block0, &block1, 11, false));
    let result = engine(&setup, Arc::clone(&connector)).begin_image(ImageBackupRequest {
        clientname: "testclient".to_string(),
        letter: "C".to_string(),
        mode: ImageMode::Full,
        with_checksum: true,
    });

    match result {
        Err(ImageError::ChecksumMismatch) => {}
        other => panic!("expected ChecksumMismatch, got {:?}", other.map(|_| ())),
    }
    // the retry budget was used up in full, with no twelfth attempt
    assert_eq!(connector.connections(), 11);

    let conn = setup.catalog.connect().unwrap();
    let complete: i64 = conn
        .query_row(
            "SELECT complete FROM backup_images",
            rusqlite::params![],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(complete, 0, "aborted image stays incomplete");
}

/// An incremental without a completed parent fails before any bytes
/// are exchanged.
#[test]
fn incremental_without_parent_fails_early() {
    let setup = setup();
    let connector = ScriptedConnector::new(vec![]);
    let result = engine(&setup, Arc::clone(&connector)).begin_image(ImageBackupRequest {
        clientname: "testclient".to_string(),
        letter: "C".to_string(),
        mode: ImageMode::Incr,
        with_checksum: false,
    });

    match result {
        Err(ImageError::ParentMissing(_)) => {}
        other => panic!("expected ParentMissing, got {:?}", other.map(|_| ())),
    }
    assert_eq!(connector.connections(), 0, "no connection was opened");
}

/// A drive size that is not a multiple of the allocation block: the
/// final digest covers the zero padding.
#[test]
fn unaligned_drive_size_pads_final_block() {
    let setup = setup();
    let blocksize = (ALLOC_BLOCK_SIZE / 2) as u32;
    // three client blocks = 1.5 allocation blocks
    let drive_size = 3 * blocksize as i64;

    let blocks: Vec<Vec<u8>> = (0..3)
        .map(|i| pattern_block(blocksize as usize, i as u8 + 40))
        .collect();

    let mut script = header(blocksize, drive_size, 3, false, false);
    for (i, block) in blocks.iter().enumerate() {
        script.extend(block_frame(i as i64, block));
    }
    script.extend(end_frame());

    let connector = ScriptedConnector::new(vec![script]);
    let backupid = engine(&setup, connector)
        .begin_image(ImageBackupRequest {
            clientname: "testclient".to_string(),
            letter: "C".to_string(),
            mode: ImageMode::Full,
            with_checksum: false,
        })
        .unwrap();

    let (path, complete, _) = image_row(&setup, backupid);
    assert!(complete);

    let hashes = HashFile::open_readonly(&PathBuf::from(format!("{}.hash", path))).unwrap();
    // ceil(1.5) = 2 allocation blocks
    assert_eq!(hashes.byte_len(), 2 * 32);

    let mut alloc0 = blocks[0].clone();
    alloc0.extend_from_slice(&blocks[1]);
    assert_eq!(hashes.digest_at(0).unwrap(), sha256(&alloc0));

    let mut alloc1 = blocks[2].clone();
    alloc1.extend_from_slice(&vec![0u8; blocksize as usize]);
    assert_eq!(
        hashes.digest_at(1).unwrap(),
        sha256(&alloc1),
        "hash of the final block includes the padding"
    );
}

/// Empty volume: completes with an empty sidecar and a valid MBR blob.
#[test]
fn empty_image_completes() {
    let setup = setup();
    let mut script = header(4096, 0, 0, false, false);
    script.extend(end_frame());

    let connector = ScriptedConnector::new(vec![script]);
    let backupid = engine(&setup, connector)
        .begin_image(ImageBackupRequest {
            clientname: "testclient".to_string(),
            letter: "C".to_string(),
            mode: ImageMode::Full,
            with_checksum: false,
        })
        .unwrap();

    let (path, complete, _) = image_row(&setup, backupid);
    assert!(complete);
    let hashes = HashFile::open_readonly(&PathBuf::from(format!("{}.hash", path))).unwrap();
    assert_eq!(hashes.byte_len(), 0);
    assert!(PathBuf::from(format!("{}.mbr", path)).exists());
}

/// The client declining the request surfaces as a remote abort and the
/// image row stays incomplete.
#[test]
fn remote_error_header_aborts() {
    let setup = setup();
    let mut script = Vec::new();
    script.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    script.extend_from_slice(b"CREATING SHADOWCOPY FAILED|#|trailing");

    let connector = ScriptedConnector::new(vec![script]);
    let result = engine(&setup, connector).begin_image(ImageBackupRequest {
        clientname: "testclient".to_string(),
        letter: "C".to_string(),
        mode: ImageMode::Full,
        with_checksum: false,
    });

    match result {
        Err(ImageError::RemoteAborted(reason)) => {
            assert!(reason.contains("CREATING SHADOWCOPY FAILED"));
            assert!(!reason.contains("trailing"));
        }
        other => panic!("expected RemoteAborted, got {:?}", other.map(|_| ())),
    }

    let conn = setup.catalog.connect().unwrap();
    let complete: i64 = conn
        .query_row(
            "SELECT complete FROM backup_images",
            rusqlite::params![],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(complete, 0, "failed image stays incomplete");
}
