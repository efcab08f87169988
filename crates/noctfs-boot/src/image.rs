//! Building and recognising boot images.

use alloc::vec::Vec;

use crate::asm::{AsmError, Assembler, Reg16, Reg8, SegReg};
use crate::layout::{
    CODE_OFFSET, DEFAULT_MESSAGE, ENTRY_JUMP_LEN, LOAD_ADDRESS, SECTOR_SIZE, SIGNATURE,
    SIGNATURE_OFFSET,
};
use crate::raw::RawBootSector;
use static_assertions::{const_assert, const_assert_eq};

/// BIOS video services
const VIDEO_INTERRUPT: u8 = 0x10;
/// INT 0x10 function: teletype output of AL
const TELETYPE_OUTPUT: u8 = 0x0E;

/// Errors that can occur when building or parsing a boot image
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("The message is empty")]
    EmptyMessage,
    /// The message would be cut short at this index
    #[error("The message contains a NUL byte at index {index}")]
    MessageContainsNul { index: usize },
    #[error("The message contains a non-printable byte {byte:#04x} at index {index}")]
    NonPrintable { index: usize, byte: u8 },
    /// The code, message and terminator do not fit in front of the signature
    #[error("The image needs {needed}b, but only {available}b are available before the signature")]
    ImageTooLarge { needed: usize, available: usize },
    /// The entry jump does not land on [`CODE_OFFSET`]
    #[error("The entry jump lands at {found:?}, expected {expected:#x}", expected = CODE_OFFSET)]
    EntryMisplaced { found: Option<usize> },
    #[error("A boot sector is 512b, got {0}b")]
    WrongSize(usize),
    #[error("The boot sector signature is missing")]
    MissingSignature,
    /// The sector was not produced by [`BootImageBuilder`]
    #[error("Unrecognized boot code at offset {offset:#x}")]
    UnrecognizedCode { offset: usize },
    #[error("The message address {address:#06x} points outside the sector")]
    MessageOutOfBounds { address: u16 },
    #[error("The message is not terminated before the signature")]
    MessageUnterminated,
    #[error(transparent)]
    Asm(#[from] AsmError),
}

/// The code [`assemble_stub`] emits at [`CODE_OFFSET`]. It does not depend on the message, which
/// always starts at [`STUB_END`].
pub(crate) const STUB_CODE: [u8; 23] = [
    0x31, 0xC0, 0x8E, 0xD8, 0xFC, 0xBE, 0x54, 0x7C, 0xAC, 0x08, 0xC0, 0x74, 0x08, 0xB4, 0x0E, 0x30,
    0xFF, 0xCD, 0x10, 0xEB, 0xF3, 0xEB, 0xFE,
];
/// `xor ax, ax; mov ds, ax; cld; mov si, imm16` up to the message address operand
const STUB_PROLOGUE_LEN: usize = 6;
/// Offset of the `mov si` operand holding the message address
pub(crate) const MESSAGE_OPERAND: usize = CODE_OFFSET + STUB_PROLOGUE_LEN;
/// Offset of the `jmp $`
pub(crate) const STUB_HALT: usize = CODE_OFFSET + 21;
pub(crate) const STUB_END: usize = CODE_OFFSET + STUB_CODE.len();

const_assert_eq!(
    u16::from_le_bytes([STUB_CODE[STUB_PROLOGUE_LEN], STUB_CODE[STUB_PROLOGUE_LEN + 1]]) as usize,
    LOAD_ADDRESS as usize + STUB_END
);
const_assert_eq!(STUB_CODE[STUB_HALT - CODE_OFFSET], 0xEB);
const_assert_eq!(STUB_CODE[STUB_HALT - CODE_OFFSET + 1], 0xFE);
const_assert!(STUB_END + DEFAULT_MESSAGE.len() < SIGNATURE_OFFSET);

struct Assembled {
    code: Vec<u8>,
    halt_offset: usize,
    message_offset: usize,
}

/// Emits the entry jump, the reserved region, the print loop, the halt loop and the message.
fn assemble_stub(message: &[u8]) -> Result<Assembled, AsmError> {
    let mut asm = Assembler::new(LOAD_ADDRESS);
    let start = asm.new_label();
    let next = asm.new_label();
    let halt = asm.new_label();
    let text = asm.new_label();

    asm.jmp_short(start);
    asm.pad_to(CODE_OFFSET)?;

    asm.bind(start);
    asm.xor_r16(Reg16::Ax, Reg16::Ax);
    asm.mov_sreg_r16(SegReg::Ds, Reg16::Ax);
    asm.cld();
    asm.mov_r16_addr(Reg16::Si, text);

    asm.bind(next);
    asm.lodsb();
    asm.or_r8(Reg8::Al, Reg8::Al);
    asm.jz_short(halt);
    asm.mov_r8_imm(Reg8::Ah, TELETYPE_OUTPUT);
    asm.xor_r8(Reg8::Bh, Reg8::Bh);
    asm.int(VIDEO_INTERRUPT);
    asm.jmp_short(next);

    asm.bind(halt);
    asm.jmp_short(halt);

    asm.bind(text);
    asm.bytes(message);
    asm.bytes(&[0]);

    let halt_offset = asm.resolve(halt)?;
    let message_offset = asm.resolve(text)?;
    let code = asm.finish()?;
    Ok(Assembled {
        code,
        halt_offset,
        message_offset,
    })
}

fn check_message(message: &[u8]) -> Result<(), ImageError> {
    if message.is_empty() {
        return Err(ImageError::EmptyMessage);
    }
    for (index, &byte) in message.iter().enumerate() {
        match byte {
            0 => return Err(ImageError::MessageContainsNul { index }),
            b' '..=b'~' | b'\r' | b'\n' => {}
            _ => return Err(ImageError::NonPrintable { index, byte }),
        }
    }
    Ok(())
}

/// A complete 512-byte boot sector.
///
/// # Example
/// ```
/// use noctfs_boot::BootImage;
///
/// let image = BootImage::reference();
/// assert_eq!(image.as_bytes().len(), 512);
/// assert_eq!(&image.as_bytes()[510..], &[0x55, 0xAA]);
/// assert_eq!(image.message(), b"This disk is not bootable. NoctFS v1.0");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct BootImage {
    bytes: [u8; SECTOR_SIZE],
    halt_offset: usize,
    message_offset: usize,
    message_len: usize,
}

impl core::fmt::Debug for BootImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BootImage")
            .field("code_offset", &CODE_OFFSET)
            .field("halt_offset", &self.halt_offset)
            .field("message_offset", &self.message_offset)
            .field(
                "message",
                &core::str::from_utf8(self.message()).unwrap_or("<invalid>"),
            )
            .finish()
    }
}

impl BootImage {
    /// The image printing [`DEFAULT_MESSAGE`], identical to what [`BootImageBuilder::new`]
    /// builds.
    pub fn reference() -> Self {
        let message = DEFAULT_MESSAGE.as_bytes();
        let mut bytes = [0u8; SECTOR_SIZE];
        bytes[0] = 0xEB;
        bytes[1] = (CODE_OFFSET - ENTRY_JUMP_LEN) as u8;
        bytes[CODE_OFFSET..STUB_END].copy_from_slice(&STUB_CODE);
        bytes[STUB_END..STUB_END + message.len()].copy_from_slice(message);
        bytes[SIGNATURE_OFFSET..].copy_from_slice(&SIGNATURE);
        Self {
            bytes,
            halt_offset: STUB_HALT,
            message_offset: STUB_END,
            message_len: message.len(),
        }
    }

    /// Recognises a sector produced by [`BootImageBuilder`].
    ///
    /// The message is located through the `mov si, imm16` operand, and the rest of the sector
    /// must match what the builder would emit for that message byte for byte.
    /// Use [`crate::verify`] for a report of every problem in an arbitrary sector.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let sector: &[u8; SECTOR_SIZE] = bytes
            .try_into()
            .map_err(|_| ImageError::WrongSize(bytes.len()))?;
        let raw = RawBootSector::from_bytes(sector);
        if !raw.check_signature() {
            return Err(ImageError::MissingSignature);
        }
        let target = raw.jump_target();
        if target != Some(CODE_OFFSET) {
            return Err(ImageError::EntryMisplaced { found: target });
        }

        message_offset(sector)?;
        // Everything in front of the message is the same in every image
        if let Some(offset) = first_difference(&sector[..STUB_END], &Self::reference().bytes) {
            log::debug!("Boot code differs from the stub at {offset:#x}");
            return Err(ImageError::UnrecognizedCode { offset });
        }
        let len = sector[STUB_END..SIGNATURE_OFFSET]
            .iter()
            .position(|&b| b == 0)
            .ok_or(ImageError::MessageUnterminated)?;

        let image = BootImageBuilder::new()
            .message(&sector[STUB_END..STUB_END + len])
            .build()
            .map_err(|err| {
                log::debug!("No boot image carries this message: {err}");
                let index = match err {
                    ImageError::NonPrintable { index, .. } => index,
                    _ => 0,
                };
                ImageError::UnrecognizedCode {
                    offset: STUB_END + index,
                }
            })?;
        if let Some(offset) = first_difference(sector, &image.bytes) {
            log::debug!("Sector differs from the rebuilt image at {offset:#x}");
            return Err(ImageError::UnrecognizedCode { offset });
        }
        Ok(image)
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.bytes
    }

    pub fn into_bytes(self) -> [u8; SECTOR_SIZE] {
        self.bytes
    }

    pub fn raw(&self) -> &RawBootSector {
        RawBootSector::from_bytes(&self.bytes)
    }

    /// The message, without its terminator
    pub fn message(&self) -> &[u8] {
        &self.bytes[self.message_offset..self.message_offset + self.message_len]
    }

    pub fn code_offset(&self) -> usize {
        CODE_OFFSET
    }

    /// Offset of the `jmp $` the stub ends in
    pub fn halt_offset(&self) -> usize {
        self.halt_offset
    }

    pub fn message_offset(&self) -> usize {
        self.message_offset
    }

    /// Offset of the first padding byte, right after the terminator
    pub fn padding_offset(&self) -> usize {
        self.message_offset + self.message_len + 1
    }

    pub fn load_address(&self) -> u16 {
        LOAD_ADDRESS
    }
}

impl AsRef<[u8]> for BootImage {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Reads the message address out of the stub prologue
pub(crate) fn message_offset(sector: &[u8; SECTOR_SIZE]) -> Result<usize, ImageError> {
    let prologue = &sector[CODE_OFFSET..MESSAGE_OPERAND];
    if let Some(i) = first_difference(prologue, &STUB_CODE[..STUB_PROLOGUE_LEN]) {
        return Err(ImageError::UnrecognizedCode {
            offset: CODE_OFFSET + i,
        });
    }
    let address = u16::from_le_bytes([sector[MESSAGE_OPERAND], sector[MESSAGE_OPERAND + 1]]);
    match address.checked_sub(LOAD_ADDRESS) {
        Some(offset) if (offset as usize) < SIGNATURE_OFFSET => Ok(offset as usize),
        _ => Err(ImageError::MessageOutOfBounds { address }),
    }
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b).position(|(a, b)| a != b)
}

/// Builds a [`BootImage`] with a custom message.
///
/// # Example
/// ```
/// use noctfs_boot::BootImageBuilder;
///
/// let image = BootImageBuilder::new()
///     .message("No system disk")
///     .build()?;
/// assert_eq!(image.message(), b"No system disk");
/// # Ok::<(), noctfs_boot::ImageError>(())
/// ```
#[derive(Debug, Clone)]
pub struct BootImageBuilder {
    message: Vec<u8>,
}

impl Default for BootImageBuilder {
    fn default() -> Self {
        Self {
            message: DEFAULT_MESSAGE.as_bytes().to_vec(),
        }
    }
}

impl BootImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: impl AsRef<[u8]>) -> Self {
        self.message = message.as_ref().to_vec();
        self
    }

    pub fn build(&self) -> Result<BootImage, ImageError> {
        check_message(&self.message)?;
        let stub = assemble_stub(&self.message)?;
        if stub.code.len() > SIGNATURE_OFFSET {
            return Err(ImageError::ImageTooLarge {
                needed: stub.code.len(),
                available: SIGNATURE_OFFSET,
            });
        }

        let mut bytes = [0u8; SECTOR_SIZE];
        bytes[..stub.code.len()].copy_from_slice(&stub.code);
        let raw = RawBootSector::from_bytes_mut(&mut bytes);
        raw.signature = SIGNATURE;

        let target = raw.jump_target();
        if target != Some(CODE_OFFSET) {
            return Err(ImageError::EntryMisplaced { found: target });
        }

        log::trace!(
            "Built boot image: code at {CODE_OFFSET:#x}, halt at {:#x}, message at {:#x} ({}b), {}b padding",
            stub.halt_offset,
            stub.message_offset,
            self.message.len(),
            SIGNATURE_OFFSET - stub.code.len()
        );
        Ok(BootImage {
            bytes,
            halt_offset: stub.halt_offset,
            message_offset: stub.message_offset,
            message_len: self.message.len(),
        })
    }
}
