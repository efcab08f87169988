//! Writing the boot sector to a device.
//!
//! A device is anything that is [`Read`] + [`Write`] + [`Seek`], usually a [`std::fs::File`]
//! holding a disk image, or a block device opened for writing.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::BootImage;
use crate::layout::{PARTITION_TABLE_RANGE, SECTOR_SIZE};

/// Errors that can occur when installing a boot sector
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The device cannot hold a boot sector
    #[error("The device is too small, expected at least 512b, got {0}b")]
    DeviceTooSmall(u64),
    /// The image extends into the partition table it was asked to preserve
    #[error("The image uses bytes up to {end:#x}, which overlaps the partition table at {start:#x}", start = PARTITION_TABLE_RANGE.start)]
    PartitionTableOverlap { end: usize },
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Keep bytes 446..510 of the existing sector, so a partitioned device stays partitioned
    pub preserve_partition_table: bool,
}

impl InstallOptions {
    pub fn with_preserve_partition_table(mut self, preserve: bool) -> Self {
        self.preserve_partition_table = preserve;
        self
    }
}

fn device_len<D: Seek>(device: &mut D) -> Result<u64, InstallError> {
    let len = device.seek(SeekFrom::End(0))?;
    if len < SECTOR_SIZE as u64 {
        return Err(InstallError::DeviceTooSmall(len));
    }
    Ok(len)
}

/// Reads sector 0 of the device
pub fn read_boot_sector<D: Read + Seek>(device: &mut D) -> Result<[u8; SECTOR_SIZE], InstallError> {
    device_len(device)?;
    let mut sector = [0u8; SECTOR_SIZE];
    device.seek(SeekFrom::Start(0))?;
    device.read_exact(&mut sector)?;
    Ok(sector)
}

/// Writes the image to sector 0 of the device, leaving every other sector untouched
pub fn install<D: Read + Write + Seek>(
    device: &mut D,
    image: &BootImage,
    options: InstallOptions,
) -> Result<(), InstallError> {
    let len = device_len(device)?;
    let mut sector = *image.as_bytes();

    if options.preserve_partition_table {
        let end = image.padding_offset();
        if end > PARTITION_TABLE_RANGE.start {
            return Err(InstallError::PartitionTableOverlap { end });
        }
        let existing = read_boot_sector(device)?;
        sector[PARTITION_TABLE_RANGE].copy_from_slice(&existing[PARTITION_TABLE_RANGE]);
        log::trace!("Preserving partition table at {PARTITION_TABLE_RANGE:?}");
    }

    device.seek(SeekFrom::Start(0))?;
    device.write_all(&sector)?;
    device.flush()?;
    log::debug!("Installed boot sector on a {len}b device");
    Ok(())
}
