//! Generated MBR for image containers.
//!
//! Every container starts with a synthesized MBR sector: fixed boot
//! code template, random disk signature, and a single primary NTFS
//! partition covering the backed-up volume. The partition begins where
//! the reserved MBR area ends, so mounting the container exposes the
//! volume at a fixed offset. This is distinct from the `.mbr` sidecar,
//! which holds the MBR captured verbatim from the client.

use super::{MBR_AREA_SIZE, SECTOR_SIZE};

/// First sector of the volume partition.
pub const PARTITION_START_SECTOR: u32 = (MBR_AREA_SIZE / SECTOR_SIZE) as u32;

const NTFS_PARTITION_TYPE: u8 = 0x07;

/// Boot code template; a tight halt loop followed by padding. Restores
/// never boot from the synthesized sector, it only has to parse.
const MBR_BOOT_CODE: [u8; 8] = [0xfa, 0xf4, 0xeb, 0xfd, 0x90, 0x90, 0x90, 0x90];

pub fn generate_mbr(drive_size: u64) -> [u8; 512] {
    let mut mbr = [0u8; 512];
    mbr[..MBR_BOOT_CODE.len()].copy_from_slice(&MBR_BOOT_CODE);

    let signature: u32 = rand::random();
    mbr[440..444].copy_from_slice(&signature.to_le_bytes());
    // bytes 444..446 stay zero

    let entry = &mut mbr[446..462];
    entry[0] = 0x80; // bootable
    entry[1] = 0xfe; // CHS start, past-the-cap marker
    entry[2] = 0xff;
    entry[3] = 0xff;
    entry[4] = NTFS_PARTITION_TYPE;
    entry[5] = 0xfe; // CHS end
    entry[6] = 0xff;
    entry[7] = 0xff;
    entry[8..12].copy_from_slice(&PARTITION_START_SECTOR.to_le_bytes());

    let sectors = (drive_size / SECTOR_SIZE).min(u32::MAX as u64) as u32;
    entry[12..16].copy_from_slice(&sectors.to_le_bytes());

    // remaining three partition entries stay empty
    mbr[510] = 0x55;
    mbr[511] = 0xaa;
    mbr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn layout_of_generated_sector() {
        let drive_size: u64 = 10 * 1024 * 1024 * 1024;
        let mbr = generate_mbr(drive_size);

        assert_eq!(&mbr[510..512], &[0x55, 0xaa]);
        assert_eq!(mbr[446], 0x80);
        assert_eq!(mbr[450], NTFS_PARTITION_TYPE);

        let start = u32::from_le_bytes(mbr[454..458].try_into().unwrap());
        assert_eq!(start, PARTITION_START_SECTOR);

        let sectors = u32::from_le_bytes(mbr[458..462].try_into().unwrap());
        assert_eq!(sectors as u64, drive_size / SECTOR_SIZE);

        // the other three partition entries are empty
        assert!(mbr[462..510].iter().all(|&b| b == 0));
    }

    #[test]
    fn huge_volume_sector_count_saturates() {
        let mbr = generate_mbr(u64::MAX);
        let sectors = u32::from_le_bytes(mbr[458..462].try_into().unwrap());
        assert_eq!(sectors, u32::MAX);
    }
}
