//! This module implements the image storage layer.
//!
//! # Data formats
//!
//! Disk images are stored as sparse VHD containers holding 512 byte
//! sectors grouped into fixed-size allocation blocks (1 MiB). An
//! incremental image is a differencing container whose unallocated
//! blocks fall through to its parent, recursively.
//!
//! Next to each container live sidecar files:
//!
//! * `.hash` — one SHA-256 digest per allocation block, appended in
//!   block order during ingest ([HashFile](struct.HashFile.html)). The
//!   sidecar doubles as the "what the server already has" map sent to
//!   the client at the start of the next incremental transfer, so it is
//!   fully populated even for differencing images.
//! * `.mbr` — the MBR captured verbatim from the client.
//! * `.bitmap` / `.cbitmap` — changed-block-tracking bitmaps, opaque to
//!   this layer.
//! * `.sync` — present while a transfer is in flight; a leftover marker
//!   means the image never completed.
//!
//! The compressed container variant (`.vhdz`) keeps the identical
//! logical layout but stores it through a zlib-per-page random-access
//! wrapper ([CompressedFile](struct.CompressedFile.html)).
//!
//! # Write path
//!
//! The protocol engine never touches the container directly. It borrows
//! fixed-size buffers from an [ImageWriter](struct.ImageWriter.html)
//! and submits `(offset, block)` pairs; a dedicated writer thread
//! commits them in FIFO order. The bounded buffer pool is what applies
//! backpressure to the network reader when the disk falls behind.
//!
//! # Consistency
//!
//! A container without a valid trailing footer is treated as
//! incomplete; the footer is only rewritten on `sync`/`close`, after
//! all data block writes. An image is marked complete in the catalog
//! only after the hash sidecar holds exactly
//! `ceil(drive_size / block_size)` digests and the container has been
//! synced, in one database transaction.

pub const SECTOR_SIZE: u64 = 512;

/// Allocation block size: unit of storage, hashing and deduplication.
pub const ALLOC_BLOCK_SIZE: u64 = 1024 * 1024;

/// Space reserved at the start of a container for the generated MBR
/// sector and padding; the backed-up volume data starts here, which
/// matches the partition start sector in the generated MBR. One full
/// allocation block, so volume block writes stay block-aligned.
pub const MBR_AREA_SIZE: u64 = ALLOC_BLOCK_SIZE;

pub const SHA_SIZE: usize = 32;

mod file_io;
pub use file_io::*;

mod compressed_file;
pub use compressed_file::*;

mod vhd;
pub use vhd::*;

mod hash_file;
pub use hash_file::*;

mod image_writer;
pub use image_writer::*;

mod mbr;
pub use mbr::*;
