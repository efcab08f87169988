//! Checks a sector against the boot image layout.
//!
//! Unlike [`crate::BootImage::from_bytes`], which stops at the first problem, [`verify`] collects
//! every violation it can find so they can all be reported at once.

use alloc::vec::Vec;
use core::fmt;

use crate::image::{self, ImageError, STUB_CODE, STUB_END, STUB_HALT};
use crate::layout::{CODE_OFFSET, RESERVED_RANGE, SECTOR_SIZE, SIGNATURE, SIGNATURE_OFFSET};
use crate::raw::RawBootSector;

/// A single way in which a sector breaks the layout
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("Image is {len}b, a boot sector is exactly 512b")]
    WrongSize { len: usize },
    #[error("Signature is {found:02x?}, expected [55, aa]")]
    BadSignature { found: [u8; 2] },
    #[error("Entry instruction {opcode:#04x} is not a short jump")]
    EntryNotShortJump { opcode: u8 },
    #[error("Entry jump lands at {target:?}, expected {expected:#x}", expected = CODE_OFFSET)]
    EntryMisplaced { target: Option<usize> },
    #[error("Reserved byte at {offset:#x} is {value:#04x}, expected 0")]
    ReservedNotZero { offset: usize, value: u8 },
    #[error("Boot code is not recognised: {0}")]
    UnrecognizedCode(ImageError),
    #[error("Message is not terminated before the signature")]
    MessageUnterminated,
    #[error("Message is empty")]
    MessageEmpty,
    #[error("Message byte at {offset:#x} is not printable ({value:#04x})")]
    MessageNotPrintable { offset: usize, value: u8 },
    #[error("Halt instruction at {offset:#x} does not jump to itself")]
    HaltNotSelfJump { offset: usize },
    #[error("Padding byte at {offset:#x} is {value:#04x}, expected 0")]
    PaddingNotZero { offset: usize, value: u8 },
}

/// The findings of [`verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    violations: Vec<Violation>,
    message: Option<Vec<u8>>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// The message, if one could be located
    pub fn message(&self) -> Option<&[u8]> {
        self.message.as_deref()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "OK");
        }
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// Checks every layout invariant of a boot sector
pub fn verify(bytes: &[u8]) -> Report {
    let mut report = Report::default();
    let Ok(sector) = <&[u8; SECTOR_SIZE]>::try_from(bytes) else {
        report.violations.push(Violation::WrongSize { len: bytes.len() });
        return report;
    };
    let raw = RawBootSector::from_bytes(sector);

    if !raw.check_signature() {
        report.violations.push(Violation::BadSignature {
            found: raw.signature,
        });
    }

    if raw.jump[0] != 0xEB {
        report.violations.push(Violation::EntryNotShortJump {
            opcode: raw.jump[0],
        });
    } else if raw.jump_target() != Some(CODE_OFFSET) {
        report.violations.push(Violation::EntryMisplaced {
            target: raw.jump_target(),
        });
    }

    // Only the first offending byte of each region is reported
    if let Some(i) = raw.reserved.iter().position(|&b| b != 0) {
        report.violations.push(Violation::ReservedNotZero {
            offset: RESERVED_RANGE.start + i,
            value: raw.reserved[i],
        });
    }

    check_code(sector, &mut report);

    let message_offset = match image::message_offset(sector) {
        Ok(offset) => offset,
        // A prologue mismatch is already reported by check_code
        Err(ImageError::UnrecognizedCode { .. }) => return report,
        Err(err) => {
            report.violations.push(Violation::UnrecognizedCode(err));
            return report;
        }
    };
    let Some(len) = sector[message_offset..SIGNATURE_OFFSET]
        .iter()
        .position(|&b| b == 0)
    else {
        report.violations.push(Violation::MessageUnterminated);
        return report;
    };
    let message = &sector[message_offset..message_offset + len];
    report.message = Some(message.to_vec());

    if message.is_empty() {
        report.violations.push(Violation::MessageEmpty);
    }
    if let Some(i) = message
        .iter()
        .position(|&b| !matches!(b, b' '..=b'~' | b'\r' | b'\n'))
    {
        report.violations.push(Violation::MessageNotPrintable {
            offset: message_offset + i,
            value: message[i],
        });
    }

    let padding_start = message_offset + len + 1;
    if let Some(i) = sector[padding_start..SIGNATURE_OFFSET]
        .iter()
        .position(|&b| b != 0)
    {
        report.violations.push(Violation::PaddingNotZero {
            offset: padding_start + i,
            value: sector[padding_start + i],
        });
    }

    log::debug!("Verified sector: {} violation(s)", report.violations.len());
    report
}

/// Compares the code against the stub, which is the same whatever the message
fn check_code(sector: &[u8; SECTOR_SIZE], report: &mut Report) {
    let halt = STUB_HALT..STUB_HALT + 2;
    if sector[halt.clone()] != [0xEB, 0xFE] {
        report.violations.push(Violation::HaltNotSelfJump { offset: STUB_HALT });
    }

    // The halt loop already has its own, more specific violation
    let mismatch = (CODE_OFFSET..STUB_END)
        .filter(|offset| !halt.contains(offset))
        .find(|&offset| sector[offset] != STUB_CODE[offset - CODE_OFFSET]);
    if let Some(offset) = mismatch {
        let err = ImageError::UnrecognizedCode { offset };
        report.violations.push(Violation::UnrecognizedCode(err));
    }
}

/// Whether the two signature bytes are present, the one check firmware performs
pub fn has_boot_signature(bytes: &[u8]) -> bool {
    bytes.len() >= SECTOR_SIZE && bytes[SIGNATURE_OFFSET..SECTOR_SIZE] == SIGNATURE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BootImage;
    use crate::layout::DEFAULT_MESSAGE;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn reference() -> [u8; SECTOR_SIZE] {
        *BootImage::reference().as_bytes()
    }

    #[test]
    fn reference_image_is_clean() {
        let report = verify(&reference());
        assert!(report.is_ok(), "{report}");
        assert_eq!(report.message(), Some(DEFAULT_MESSAGE.as_bytes()));
        assert_eq!(report.to_string(), "OK");
    }

    #[test]
    fn wrong_size_stops_early() {
        let report = verify(&[0u8; 1024]);
        assert_eq!(report.violations(), &[Violation::WrongSize { len: 1024 }]);
    }

    #[test]
    fn every_problem_is_reported() {
        let mut bytes = reference();
        bytes[0x10] = 0xCC;
        bytes[0x1F0] = 0x01;
        bytes[511] = 0x00;
        let report = verify(&bytes);
        assert_eq!(
            report.violations(),
            &[
                Violation::BadSignature { found: [0x55, 0x00] },
                Violation::ReservedNotZero { offset: 0x10, value: 0xCC },
                Violation::PaddingNotZero { offset: 0x1F0, value: 0x01 },
            ]
        );
        assert_eq!(report.to_string().lines().count(), 3);
    }

    #[test]
    fn entry_jump_checks() {
        let mut bytes = reference();
        bytes[0] = 0xE9;
        assert_eq!(
            verify(&bytes).violations(),
            &[Violation::EntryNotShortJump { opcode: 0xE9 }]
        );

        let mut bytes = reference();
        bytes[1] = 0x00;
        assert_eq!(
            verify(&bytes).violations(),
            &[Violation::EntryMisplaced { target: Some(2) }]
        );
    }

    #[test]
    fn halt_must_jump_to_itself() {
        let mut bytes = reference();
        bytes[0x53] = 0xFC;
        assert_eq!(
            verify(&bytes).violations(),
            &[Violation::HaltNotSelfJump { offset: 0x52 }]
        );
    }

    #[test]
    fn patched_print_loop_is_unrecognized() {
        let mut bytes = reference();
        // mov ah, 0x0e -> mov ah, 0x0f
        bytes[0x4B] = 0x0F;
        assert_eq!(
            verify(&bytes).violations(),
            &[Violation::UnrecognizedCode(ImageError::UnrecognizedCode {
                offset: 0x4B
            })]
        );
    }

    #[test]
    fn unterminated_message() {
        let mut bytes = reference();
        bytes[0x54..SIGNATURE_OFFSET].fill(b'.');
        assert_eq!(
            verify(&bytes).violations(),
            &[Violation::MessageUnterminated]
        );
    }

    #[test]
    fn control_characters_in_the_message() {
        let mut bytes = reference();
        bytes[0x55] = 0x07;
        let report = verify(&bytes);
        assert_eq!(
            report.violations(),
            &[Violation::MessageNotPrintable { offset: 0x55, value: 0x07 }]
        );
    }

    #[test]
    fn empty_message_does_not_hide_broken_code() {
        let mut bytes = reference();
        bytes[0x54..0x7B].fill(0);
        // jmp $ -> jmp short +0, int 0x10 -> nop
        bytes[0x53] = 0x00;
        bytes[0x4E] = 0x90;
        let report = verify(&bytes);
        assert_eq!(
            report.violations(),
            &[
                Violation::HaltNotSelfJump { offset: 0x52 },
                Violation::UnrecognizedCode(ImageError::UnrecognizedCode { offset: 0x4E }),
                Violation::MessageEmpty,
            ]
        );
        assert_eq!(report.message(), Some(&b""[..]));
    }

    #[test]
    fn empty_message_alone() {
        let mut bytes = reference();
        bytes[0x54..0x7B].fill(0);
        assert_eq!(verify(&bytes).violations(), &[Violation::MessageEmpty]);
    }

    #[test]
    fn message_pointer_into_the_code() {
        let mut bytes = reference();
        bytes[0x43] = 0x3D;
        let report = verify(&bytes);
        assert_eq!(
            report.violations()[0],
            Violation::UnrecognizedCode(ImageError::UnrecognizedCode { offset: 0x43 })
        );
        assert!(!report.is_ok());
    }

    #[test]
    fn agrees_with_from_bytes_on_mutated_sectors() {
        let interesting = [0x00, 0x01, 0x07, b' ', b'A', b'~', 0x7F, 0x54, 0x7C, 0xEB, 0xFE, 0xFF];
        let mut rng = SmallRng::seed_from_u64(0x4E6F_6374);
        for _ in 0..20_000 {
            let mut bytes = reference();
            for _ in 0..rng.random_range(1..=3) {
                // Most sectors only differ around the code and the message
                let offset = if rng.random_bool(0.8) {
                    rng.random_range(0..0x80)
                } else {
                    rng.random_range(0..SECTOR_SIZE)
                };
                bytes[offset] = if rng.random_bool(0.5) {
                    interesting[rng.random_range(0..interesting.len())]
                } else {
                    rng.random()
                };
            }
            assert_eq!(
                verify(&bytes).is_ok(),
                BootImage::from_bytes(&bytes).is_ok(),
                "{bytes:02x?}"
            );
        }
    }

    #[test]
    fn signature_only_check() {
        let bytes = reference();
        assert!(has_boot_signature(&bytes));
        assert!(!has_boot_signature(&bytes[..511]));
        assert!(!has_boot_signature(&[0u8; 512]));
    }
}
