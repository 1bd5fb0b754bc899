//! Sparse VHD container, dynamic and differencing variants.
//!
//! The on-disk layout is the standard VHD one: a 512 byte footer at the
//! end of the file (mirrored at offset 0), a 1024 byte dynamic header,
//! the block allocation table, and per-block data preceded by a sector
//! bitmap. Differencing containers carry their parent path in a
//! `W2ku` parent locator and fall through to the parent for
//! unallocated blocks. The trailing footer is only written on `sync`,
//! so a crashed transfer leaves a container that opens as `Incomplete`.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::compressed_file::CompressedFile;
use super::file_io::RandomFile;
use super::SECTOR_SIZE;

const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";
const FOOTER_SIZE: u64 = 512;
const DYNAMIC_HEADER_SIZE: u64 = 1024;
const DISK_TYPE_DYNAMIC: u32 = 3;
const DISK_TYPE_DIFFERENCING: u32 = 4;
const BAT_UNUSED: u32 = 0xFFFF_FFFF;
const PLATFORM_W2KU: u32 = 0x5732_6B75; // "W2ku"
/// VHD timestamps count seconds since 2000-01-01 00:00 UTC.
const VHD_EPOCH_OFFSET: i64 = 946_684_800;

pub const COMPRESSED_EXTENSION: &str = "vhdz";

#[derive(Debug, Error)]
pub enum VhdError {
    #[error("container {0:?} not found")]
    NotFound(PathBuf),
    #[error("container {0:?} is corrupt: {1}")]
    Corrupt(PathBuf, String),
    #[error("container {0:?} has no valid trailer")]
    Incomplete(PathBuf),
    #[error("parent of container {0:?} cannot be opened: {1}")]
    ParentMissing(PathBuf, String),
    #[error("access beyond the virtual disk end (offset {offset}, len {len}, size {size})")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[error("container is opened read-only")]
    ReadOnly,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

struct Footer {
    timestamp: u32,
    current_size: u64,
    disk_type: u32,
    uuid: [u8; 16],
}

impl Footer {
    fn serialize(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut buf = [0u8; FOOTER_SIZE as usize];
        buf[0..8].copy_from_slice(FOOTER_COOKIE);
        buf[8..12].copy_from_slice(&2u32.to_be_bytes()); // features: reserved bit
        buf[12..16].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        buf[16..24].copy_from_slice(&FOOTER_SIZE.to_be_bytes()); // dynamic header offset
        buf[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[28..32].copy_from_slice(b"bbak");
        buf[32..36].copy_from_slice(&0x0000_9000u32.to_be_bytes());
        buf[36..40].copy_from_slice(b"Wi2k");
        buf[40..48].copy_from_slice(&self.current_size.to_be_bytes()); // original size
        buf[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        buf[56..60].copy_from_slice(&disk_geometry(self.current_size).to_be_bytes());
        buf[60..64].copy_from_slice(&self.disk_type.to_be_bytes());
        buf[68..84].copy_from_slice(&self.uuid);
        buf[84] = 0; // saved state
        let checksum = ones_complement_checksum(&buf);
        buf[64..68].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Result<Self, String> {
        if &buf[0..8] != FOOTER_COOKIE {
            return Err("bad footer cookie".to_string());
        }
        let stored = u32::from_be_bytes(buf[64..68].try_into().unwrap());
        let mut copy = buf.to_vec();
        copy[64..68].copy_from_slice(&[0u8; 4]);
        if ones_complement_checksum(&copy) != stored {
            return Err("footer checksum mismatch".to_string());
        }
        let disk_type = u32::from_be_bytes(buf[60..64].try_into().unwrap());
        if disk_type != DISK_TYPE_DYNAMIC && disk_type != DISK_TYPE_DIFFERENCING {
            return Err(format!("unsupported disk type {}", disk_type));
        }
        Ok(Self {
            timestamp: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            current_size: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            disk_type,
            uuid: buf[68..84].try_into().unwrap(),
        })
    }
}

struct DynamicHeader {
    table_offset: u64,
    max_table_entries: u32,
    block_size: u32,
    parent_uuid: [u8; 16],
    parent_timestamp: u32,
    parent_path: Option<PathBuf>,
}

impl DynamicHeader {
    fn serialize(&self, locator: Option<(u64, u32, u32)>) -> [u8; DYNAMIC_HEADER_SIZE as usize] {
        let mut buf = [0u8; DYNAMIC_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(DYNAMIC_COOKIE);
        buf[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        buf[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        buf[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        buf[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        buf[40..56].copy_from_slice(&self.parent_uuid);
        buf[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        if let Some(path) = &self.parent_path {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut pos = 64;
            for unit in name.encode_utf16().take(255) {
                buf[pos..pos + 2].copy_from_slice(&unit.to_be_bytes());
                pos += 2;
            }
        }
        if let Some((data_offset, data_space, data_length)) = locator {
            // first parent locator entry
            buf[576..580].copy_from_slice(&PLATFORM_W2KU.to_be_bytes());
            buf[580..584].copy_from_slice(&data_space.to_be_bytes());
            buf[584..588].copy_from_slice(&data_length.to_be_bytes());
            buf[592..600].copy_from_slice(&data_offset.to_be_bytes());
        }
        let checksum = ones_complement_checksum(&buf);
        buf[36..40].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    fn parse<F: RandomFile + ?Sized>(buf: &[u8], file: &mut F) -> Result<Self, String> {
        if &buf[0..8] != DYNAMIC_COOKIE {
            return Err("bad dynamic header cookie".to_string());
        }
        let stored = u32::from_be_bytes(buf[36..40].try_into().unwrap());
        let mut copy = buf.to_vec();
        copy[36..40].copy_from_slice(&[0u8; 4]);
        if ones_complement_checksum(&copy) != stored {
            return Err("dynamic header checksum mismatch".to_string());
        }

        let mut parent_path = None;
        for entry in 0..8 {
            let base = 576 + entry * 24;
            let platform = u32::from_be_bytes(buf[base..base + 4].try_into().unwrap());
            if platform != PLATFORM_W2KU {
                continue;
            }
            let data_length = u32::from_be_bytes(buf[base + 8..base + 12].try_into().unwrap());
            let data_offset = u64::from_be_bytes(buf[base + 16..base + 24].try_into().unwrap());
            let mut raw = vec![0u8; data_length as usize];
            file.read_exact_at(&mut raw, data_offset)
                .map_err(|err| format!("unable to read parent locator - {}", err))?;
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|chunk| u16::from_le_bytes(chunk.try_into().unwrap()))
                .collect();
            parent_path = Some(PathBuf::from(String::from_utf16_lossy(&units)));
            break;
        }

        Ok(Self {
            table_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            max_table_entries: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            block_size: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            parent_uuid: buf[40..56].try_into().unwrap(),
            parent_timestamp: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
            parent_path,
        })
    }
}

fn ones_complement_checksum(buf: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &byte in buf {
        sum = sum.wrapping_add(byte as u32);
    }
    !sum
}

/// CHS geometry per the VHD specification appendix.
fn disk_geometry(size: u64) -> u32 {
    let mut total_sectors = size / SECTOR_SIZE;
    if total_sectors > 65535 * 16 * 255 {
        total_sectors = 65535 * 16 * 255;
    }

    let (cylinders, heads, sectors_per_track);
    if total_sectors >= 65535 * 16 * 63 {
        sectors_per_track = 255u64;
        heads = 16u64;
        cylinders = total_sectors / sectors_per_track / heads;
    } else {
        let mut spt = 17u64;
        let mut cylinder_x_heads = total_sectors / spt;
        let mut hds = (cylinder_x_heads + 1023) / 1024;
        if hds < 4 {
            hds = 4;
        }
        if cylinder_x_heads >= hds * 1024 || hds > 16 {
            spt = 31;
            hds = 16;
            cylinder_x_heads = total_sectors / spt;
        }
        if cylinder_x_heads >= hds * 1024 {
            spt = 63;
            hds = 16;
            cylinder_x_heads = total_sectors / spt;
        }
        sectors_per_track = spt;
        heads = hds;
        cylinders = cylinder_x_heads / hds;
    }

    ((cylinders as u32) << 16) | ((heads as u32) << 8) | sectors_per_track as u32
}

fn vhd_timestamp() -> u32 {
    let now = chrono::Utc::now().timestamp();
    (now - VHD_EPOCH_OFFSET).max(0) as u32
}

fn is_compressed_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == COMPRESSED_EXTENSION)
        .unwrap_or(false)
}

pub struct VhdFile {
    path: PathBuf,
    file: Box<dyn RandomFile>,
    footer: Footer,
    header: DynamicHeader,
    bat: Vec<u32>,
    /// End of the data area; the trailing footer goes here on sync.
    data_end: u64,
    bitmap_bytes: u64,
    parent: Option<Box<VhdFile>>,
    read_only: bool,
}

impl VhdFile {
    /// Create a new empty dynamic container.
    pub fn create(
        path: &Path,
        logical_size: u64,
        block_size: u32,
        compressed: bool,
    ) -> Result<Self, VhdError> {
        if logical_size % SECTOR_SIZE != 0 {
            return Err(VhdError::Corrupt(
                path.to_path_buf(),
                format!("logical size {} is not sector aligned", logical_size),
            ));
        }
        let footer = Footer {
            timestamp: vhd_timestamp(),
            current_size: logical_size,
            disk_type: DISK_TYPE_DYNAMIC,
            uuid: rand::random(),
        };
        Self::create_common(path, footer, block_size, None, compressed)
    }

    /// Create a differencing container on top of `parent_path`.
    ///
    /// Size and block size are inherited from the parent.
    pub fn create_diff(path: &Path, parent_path: &Path, compressed: bool) -> Result<Self, VhdError> {
        let parent = Self::open(parent_path, OpenMode::Read).map_err(|err| {
            VhdError::ParentMissing(path.to_path_buf(), err.to_string())
        })?;

        let footer = Footer {
            timestamp: vhd_timestamp(),
            current_size: parent.footer.current_size,
            disk_type: DISK_TYPE_DIFFERENCING,
            uuid: rand::random(),
        };
        let block_size = parent.header.block_size;
        Self::create_common(path, footer, block_size, Some(parent), compressed)
    }

    fn create_common(
        path: &Path,
        footer: Footer,
        block_size: u32,
        parent: Option<VhdFile>,
        compressed: bool,
    ) -> Result<Self, VhdError> {
        if block_size == 0 || block_size as u64 % SECTOR_SIZE != 0 {
            return Err(VhdError::Corrupt(
                path.to_path_buf(),
                format!("invalid block size {}", block_size),
            ));
        }

        let raw = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut file: Box<dyn RandomFile> = if compressed {
            Box::new(CompressedFile::create(raw)?)
        } else {
            Box::new(raw)
        };

        let max_table_entries =
            ((footer.current_size + block_size as u64 - 1) / block_size as u64) as u32;
        let table_offset = FOOTER_SIZE + DYNAMIC_HEADER_SIZE;
        let bat_bytes = round_up(max_table_entries as u64 * 4, SECTOR_SIZE);
        let mut data_end = table_offset + bat_bytes;

        let mut locator = None;
        let mut locator_data = Vec::new();
        if let Some(parent) = &parent {
            let path_str = parent.path.to_string_lossy();
            for unit in path_str.encode_utf16() {
                locator_data.extend_from_slice(&unit.to_le_bytes());
            }
            let space = round_up(locator_data.len() as u64, SECTOR_SIZE);
            locator = Some((
                data_end,
                (space / SECTOR_SIZE) as u32,
                locator_data.len() as u32,
            ));
            data_end += space;
        }

        let header = DynamicHeader {
            table_offset,
            max_table_entries,
            block_size,
            parent_uuid: parent.as_ref().map(|p| p.footer.uuid).unwrap_or([0u8; 16]),
            parent_timestamp: parent.as_ref().map(|p| p.footer.timestamp).unwrap_or(0),
            parent_path: parent.as_ref().map(|p| p.path.clone()),
        };

        // mirror of the footer up front, then the structures
        file.write_at(0, &footer.serialize())?;
        file.write_at(FOOTER_SIZE, &header.serialize(locator))?;
        let bat = vec![BAT_UNUSED; max_table_entries as usize];
        let mut bat_raw = vec![0xffu8; bat_bytes as usize];
        for (i, entry) in bat.iter().enumerate() {
            bat_raw[i * 4..i * 4 + 4].copy_from_slice(&entry.to_be_bytes());
        }
        file.write_at(table_offset, &bat_raw)?;
        if !locator_data.is_empty() {
            file.write_at(table_offset + bat_bytes, &locator_data)?;
        }

        let bitmap_bytes = round_up(block_size as u64 / SECTOR_SIZE / 8, SECTOR_SIZE);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            footer,
            header,
            bat,
            data_end,
            bitmap_bytes,
            parent: parent.map(Box::new),
            read_only: false,
        })
    }

    /// Open an existing container.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self, VhdError> {
        if !path.exists() {
            return Err(VhdError::NotFound(path.to_path_buf()));
        }
        let raw = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(path)?;
        let mut file: Box<dyn RandomFile> = if is_compressed_path(path) {
            let wrapped = CompressedFile::open(raw).map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    VhdError::Incomplete(path.to_path_buf())
                } else {
                    VhdError::Corrupt(path.to_path_buf(), err.to_string())
                }
            })?;
            Box::new(wrapped)
        } else {
            Box::new(raw)
        };

        let file_len = file.len()?;
        if file_len < FOOTER_SIZE + DYNAMIC_HEADER_SIZE {
            return Err(VhdError::Corrupt(path.to_path_buf(), "file too small".into()));
        }

        let mut buf = [0u8; FOOTER_SIZE as usize];
        file.read_exact_at(&mut buf, file_len - FOOTER_SIZE)?;
        let footer = match Footer::parse(&buf) {
            Ok(footer) => footer,
            Err(trailer_err) => {
                // fall back to the mirror; a valid mirror with a bad
                // trailer is an interrupted transfer, not corruption
                file.read_exact_at(&mut buf, 0)?;
                return match Footer::parse(&buf) {
                    Ok(_) => Err(VhdError::Incomplete(path.to_path_buf())),
                    Err(_) => Err(VhdError::Corrupt(path.to_path_buf(), trailer_err)),
                };
            }
        };

        let mut header_buf = [0u8; DYNAMIC_HEADER_SIZE as usize];
        file.read_exact_at(&mut header_buf, FOOTER_SIZE)?;
        let header = DynamicHeader::parse(&header_buf, file.as_mut())
            .map_err(|err| VhdError::Corrupt(path.to_path_buf(), err))?;

        let mut bat_raw = vec![0u8; header.max_table_entries as usize * 4];
        file.read_exact_at(&mut bat_raw, header.table_offset)?;
        let bat: Vec<u32> = bat_raw
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()))
            .collect();

        let parent = if footer.disk_type == DISK_TYPE_DIFFERENCING {
            let parent_path = header.parent_path.clone().ok_or_else(|| {
                VhdError::Corrupt(path.to_path_buf(), "differencing disk without parent locator".into())
            })?;
            let parent = Self::open(&parent_path, OpenMode::Read)
                .map_err(|err| VhdError::ParentMissing(path.to_path_buf(), err.to_string()))?;
            if parent.footer.uuid != header.parent_uuid {
                return Err(VhdError::ParentMissing(
                    path.to_path_buf(),
                    format!("parent {:?} has a different unique id", parent_path),
                ));
            }
            Some(Box::new(parent))
        } else {
            None
        };

        let bitmap_bytes = round_up(header.block_size as u64 / SECTOR_SIZE / 8, SECTOR_SIZE);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            footer,
            header,
            bat,
            data_end: file_len - FOOTER_SIZE,
            bitmap_bytes,
            parent,
            read_only: mode == OpenMode::Read,
        })
    }

    pub fn logical_size(&self) -> u64 {
        self.footer.current_size
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    pub fn physical_size(&mut self) -> Result<u64, VhdError> {
        Ok(self.file.len()?)
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), VhdError> {
        if offset + len > self.footer.current_size {
            return Err(VhdError::OutOfRange {
                offset,
                len,
                size: self.footer.current_size,
            });
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`, falling through to the
    /// parent chain for unallocated blocks; holes read as zeroes.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), VhdError> {
        self.check_range(offset, buf.len() as u64)?;

        let block_size = self.header.block_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = (pos / block_size) as usize;
            let in_block = pos % block_size;
            let chunk = (buf.len() - done).min((block_size - in_block) as usize);
            let out = &mut buf[done..done + chunk];

            match self.bat[block] {
                BAT_UNUSED => match &mut self.parent {
                    Some(parent) => parent.read(pos, out)?,
                    None => out.iter_mut().for_each(|byte| *byte = 0),
                },
                sector => {
                    let data_start = sector as u64 * SECTOR_SIZE + self.bitmap_bytes;
                    // short reads past the allocated tail are holes
                    let mut read = 0;
                    while read < out.len() {
                        match self.file.read_at(&mut out[read..], data_start + in_block + read as u64)? {
                            0 => {
                                out[read..].iter_mut().for_each(|byte| *byte = 0);
                                break;
                            }
                            n => read += n,
                        }
                    }
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Write `data` at `offset`, allocating blocks as needed.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), VhdError> {
        if self.read_only {
            return Err(VhdError::ReadOnly);
        }
        self.check_range(offset, data.len() as u64)?;

        let block_size = self.header.block_size as u64;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let block = (pos / block_size) as usize;
            let in_block = pos % block_size;
            let chunk = (data.len() - done).min((block_size - in_block) as usize);

            let sector = self.allocate_block(block)?;
            let data_start = sector as u64 * SECTOR_SIZE + self.bitmap_bytes;
            self.file.write_at(data_start + in_block, &data[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    fn allocate_block(&mut self, block: usize) -> Result<u32, VhdError> {
        if self.bat[block] != BAT_UNUSED {
            return Ok(self.bat[block]);
        }

        let sector = (self.data_end / SECTOR_SIZE) as u32;
        let bitmap = vec![0xffu8; self.bitmap_bytes as usize];
        self.file.write_at(self.data_end, &bitmap)?;
        self.data_end += self.bitmap_bytes + self.header.block_size as u64;

        self.bat[block] = sector;
        self.file.write_at(
            self.header.table_offset + block as u64 * 4,
            &sector.to_be_bytes(),
        )?;
        Ok(sector)
    }

    /// Flush everything and write the trailing footer. Until this has
    /// run, the container reads back as `Incomplete`.
    pub fn sync(&mut self) -> Result<(), VhdError> {
        if self.read_only {
            return Ok(());
        }
        let footer = self.footer.serialize();
        self.file.write_at(self.data_end, &footer)?;
        self.file.set_len(self.data_end + FOOTER_SIZE)?;
        self.file.sync()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), VhdError> {
        self.sync()
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}
