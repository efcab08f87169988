//! Fixed byte layout of the boot sector.
//!
//! ```text
//! 0x000  EB 3B              jmp short start
//! 0x002  00 * 59            reserved header region
//! 0x03D  ...                print/halt code, then the message and its terminator
//! ....   00 ...             zero padding
//! 0x1FE  55 AA              boot signature
//! ```

use core::ops::Range;
use static_assertions::const_assert_eq;

/// The size of a boot sector, and of every image this crate produces.
pub const SECTOR_SIZE: usize = 512;

/// The address BIOS firmware loads the boot sector to (segment 0).
pub const LOAD_ADDRESS: u16 = 0x7C00;

/// Length of the `jmp short` instruction at offset 0.
pub const ENTRY_JUMP_LEN: usize = 2;

/// The offset the entry jump lands on, where the executable code starts.
pub const CODE_OFFSET: usize = 0x3D;

/// Zero bytes reserved for a future header between the jump and the code.
pub const RESERVED_RANGE: Range<usize> = ENTRY_JUMP_LEN..CODE_OFFSET;
pub const RESERVED_LEN: usize = CODE_OFFSET - ENTRY_JUMP_LEN;

/// Where the boot signature lives.
pub const SIGNATURE_OFFSET: usize = 510;
pub const SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Everything between the reserved region and the signature.
pub const BODY_RANGE: Range<usize> = CODE_OFFSET..SIGNATURE_OFFSET;
pub const BODY_LEN: usize = SIGNATURE_OFFSET - CODE_OFFSET;

/// The MBR partition table, if the device carries one.
pub const PARTITION_TABLE_RANGE: Range<usize> = 446..SIGNATURE_OFFSET;

/// The text printed when the device is booted.
pub const DEFAULT_MESSAGE: &str = "This disk is not bootable. NoctFS v1.0";

const_assert_eq!(ENTRY_JUMP_LEN + RESERVED_LEN, CODE_OFFSET);
const_assert_eq!(CODE_OFFSET, 0x3D);
const_assert_eq!(CODE_OFFSET + BODY_LEN + SIGNATURE.len(), SECTOR_SIZE);
const_assert_eq!(PARTITION_TABLE_RANGE.end - PARTITION_TABLE_RANGE.start, 64);
