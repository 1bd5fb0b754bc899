use std::convert::TryInto;
use std::fs::File;
use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::file_io::RandomFile;

const COMPRESSED_FILE_MAGIC: &[u8; 8] = b"BBCFZLB1";
const HEADER_SIZE: u64 = 8 + 4 + 4; // magic, page size, header crc
const DEFAULT_PAGE_SIZE: u32 = 512 * 1024;

/// Zlib-per-page random-access file.
///
/// Pages are compressed independently and appended to the backing file;
/// a page index plus the logical length is written as a trailer on
/// `sync`. Rewriting a page appends a fresh copy and repoints the index
/// entry, leaving the stale copy behind — image containers are written
/// once, so the waste is bounded to retransmitted blocks.
#[derive(Debug)]
pub struct CompressedFile {
    file: File,
    page_size: u32,
    /// (file offset, compressed length) per page; offset 0 = unwritten.
    index: Vec<(u64, u32)>,
    logical_len: u64,
    append_pos: u64,
    cur_page: Option<usize>,
    cur_data: Vec<u8>,
    cur_dirty: bool,
}

impl CompressedFile {
    pub fn create(file: File) -> io::Result<Self> {
        Self::create_with_page_size(file, DEFAULT_PAGE_SIZE)
    }

    pub fn create_with_page_size(mut file: File, page_size: u32) -> io::Result<Self> {
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(COMPRESSED_FILE_MAGIC);
        header.extend_from_slice(&page_size.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        header.extend_from_slice(&hasher.finalize().to_le_bytes());
        RandomFile::write_at(&mut file, 0, &header)?;

        Ok(Self {
            file,
            page_size,
            index: Vec::new(),
            logical_len: 0,
            append_pos: HEADER_SIZE,
            cur_page: None,
            cur_data: Vec::new(),
            cur_dirty: false,
        })
    }

    pub fn open(mut file: File) -> io::Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        RandomFile::read_exact_at(&mut file, &mut header, 0)?;
        if &header[0..8] != COMPRESSED_FILE_MAGIC {
            return Err(invalid("wrong compressed file magic"));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[0..12]);
        if hasher.finalize() != u32::from_le_bytes(header[12..16].try_into().unwrap()) {
            return Err(invalid("compressed file header checksum mismatch"));
        }
        let page_size = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if page_size == 0 {
            return Err(invalid("compressed file page size is zero"));
        }

        // trailer: index entries, logical len, index offset, magic
        let file_len = RandomFile::len(&mut file)?;
        if file_len < HEADER_SIZE + 24 {
            return Err(truncated("compressed file has no trailer"));
        }
        let mut tail = [0u8; 24];
        RandomFile::read_exact_at(&mut file, &mut tail, file_len - 24)?;
        if &tail[16..24] != COMPRESSED_FILE_MAGIC {
            return Err(truncated("compressed file trailer missing"));
        }
        let logical_len = u64::from_le_bytes(tail[0..8].try_into().unwrap());
        let index_offset = u64::from_le_bytes(tail[8..16].try_into().unwrap());
        if index_offset < HEADER_SIZE || index_offset > file_len - 24 {
            return Err(invalid("compressed file index offset out of range"));
        }

        let entries = (file_len - 24 - index_offset) / 12;
        let mut raw = vec![0u8; (entries * 12) as usize];
        RandomFile::read_exact_at(&mut file, &mut raw, index_offset)?;
        let mut index = Vec::with_capacity(entries as usize);
        for chunk in raw.chunks_exact(12) {
            index.push((
                u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
            ));
        }

        Ok(Self {
            file,
            page_size,
            index,
            logical_len,
            append_pos: index_offset,
            cur_page: None,
            cur_data: Vec::new(),
            cur_dirty: false,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    fn load_page(&mut self, page: usize) -> io::Result<()> {
        if self.cur_page == Some(page) {
            return Ok(());
        }
        self.flush_page()?;

        self.cur_data = vec![0u8; self.page_size as usize];
        if let Some(&(offset, comp_len)) = self.index.get(page) {
            if offset != 0 {
                let mut comp = vec![0u8; comp_len as usize];
                eprintln!("DEBUG load_page page={} offset={} comp_len={} fd={}", page, offset, comp_len, std::os::unix::io::AsRawFd::as_raw_fd(&self.file));
                RandomFile::read_exact_at(&mut self.file, &mut comp, offset)?;
                let mut decoder = ZlibDecoder::new(&comp[..]);
                decoder.read_exact(&mut self.cur_data)?;
            }
        }
        self.cur_page = Some(page);
        self.cur_dirty = false;
        Ok(())
    }

    fn flush_page(&mut self) -> io::Result<()> {
        let page = match self.cur_page {
            Some(page) if self.cur_dirty => page,
            _ => return Ok(()),
        };

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.cur_data)?;
        let comp = encoder.finish()?;

        let offset = self.append_pos;
        RandomFile::write_at(&mut self.file, offset, &comp)?;
        self.append_pos += comp.len() as u64;

        if self.index.len() <= page {
            self.index.resize(page + 1, (0, 0));
        }
        self.index[page] = (offset, comp.len() as u32);
        self.cur_dirty = false;
        Ok(())
    }

    fn write_trailer(&mut self) -> io::Result<()> {
        let index_offset = self.append_pos;
        let mut out = Vec::with_capacity(self.index.len() * 12 + 24);
        for &(offset, len) in &self.index {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
        }
        out.extend_from_slice(&self.logical_len.to_le_bytes());
        out.extend_from_slice(&index_offset.to_le_bytes());
        out.extend_from_slice(COMPRESSED_FILE_MAGIC);
        RandomFile::write_at(&mut self.file, index_offset, &out)?;
        RandomFile::set_len(&mut self.file, index_offset + out.len() as u64)?;
        Ok(())
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// A vanished trailer means the file was never synced, which callers
/// treat as an interrupted transfer rather than corruption.
fn truncated(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, msg.to_string())
}

impl RandomFile for CompressedFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.logical_len {
            return Ok(0);
        }
        let len = buf.len().min((self.logical_len - offset) as usize);
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let page = (pos / self.page_size as u64) as usize;
            let in_page = (pos % self.page_size as u64) as usize;
            let chunk = (len - done).min(self.page_size as usize - in_page);
            self.load_page(page)?;
            buf[done..done + chunk].copy_from_slice(&self.cur_data[in_page..in_page + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = (pos / self.page_size as u64) as usize;
            let in_page = (pos % self.page_size as u64) as usize;
            let chunk = (buf.len() - done).min(self.page_size as usize - in_page);
            self.load_page(page)?;
            self.cur_data[in_page..in_page + chunk].copy_from_slice(&buf[done..done + chunk]);
            self.cur_dirty = true;
            done += chunk;
        }
        self.logical_len = self.logical_len.max(offset + buf.len() as u64);
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.logical_len)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        // only used to grow or trim the logical area; page data of a
        // trimmed tail stays in the file
        self.logical_len = len;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush_page()?;
        self.write_trailer()?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn round_trip_across_pages() {
        let (_dir, path) = scratch("data.z");
        let mut cf =
            CompressedFile::create_with_page_size(File::create(&path).unwrap(), 4096).unwrap();

        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        cf.write_at(100, &data).unwrap();
        cf.sync().unwrap();
        drop(cf);

        let mut cf = CompressedFile::open(
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(RandomFile::len(&mut cf).unwrap(), 100 + data.len() as u64);

        let mut back = vec![0u8; data.len()];
        cf.read_exact_at(&mut back, 100).unwrap();
        assert_eq!(back, data);

        // unwritten head reads as zeroes
        let mut head = [0xffu8; 100];
        cf.read_exact_at(&mut head, 0).unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn rewrite_takes_latest_copy() {
        let (_dir, path) = scratch("rw.z");
        let mut cf =
            CompressedFile::create_with_page_size(File::create(&path).unwrap(), 1024).unwrap();
        cf.write_at(0, &[1u8; 1024]).unwrap();
        cf.write_at(2048, &[2u8; 1024]).unwrap();
        cf.write_at(0, &[3u8; 1024]).unwrap();
        cf.sync().unwrap();
        drop(cf);

        let mut cf = CompressedFile::open(File::open(&path).unwrap()).unwrap();
        let mut buf = [0u8; 1024];
        cf.read_exact_at(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 3));
        cf.read_exact_at(&mut buf, 2048).unwrap();
        assert!(buf.iter().all(|&b| b == 2));
    }

    #[test]
    fn open_without_trailer_fails() {
        let (_dir, path) = scratch("trunc.z");
        let cf = CompressedFile::create(File::create(&path).unwrap()).unwrap();
        drop(cf); // never synced

        let err = CompressedFile::open(File::open(&path).unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
