use crate::layout::{BODY_LEN, RESERVED_LEN, SECTOR_SIZE, SIGNATURE};

/// The boot sector as it sits on disk.
#[repr(C, packed)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawBootSector {
    /// `jmp short start`, opcode and rel8 displacement
    pub jump: [u8; 2],
    /// Reserved for a future header, always zero
    pub reserved: [u8; RESERVED_LEN],
    /// Code, message and zero padding
    pub body: [u8; BODY_LEN],
    /// Signature_word
    ///
    /// Should be 0xAA55
    pub signature: [u8; 2],
}

impl RawBootSector {
    pub fn from_bytes(bytes: &[u8; SECTOR_SIZE]) -> &RawBootSector {
        bytemuck::cast_ref(bytes)
    }

    pub fn from_bytes_mut(bytes: &mut [u8; SECTOR_SIZE]) -> &mut RawBootSector {
        bytemuck::cast_mut(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        bytemuck::cast_ref(self)
    }

    pub fn check_signature(&self) -> bool {
        self.signature == SIGNATURE
    }

    pub fn signature_word(&self) -> u16 {
        u16::from_le_bytes(self.signature)
    }

    /// The absolute offset the entry jump lands on, if it is a short jump.
    pub fn jump_target(&self) -> Option<usize> {
        if self.jump[0] != 0xEB {
            return None;
        }
        let displacement = self.jump[1] as i8 as isize;
        // The rel8 is relative to the end of the two byte instruction
        2usize.checked_add_signed(displacement)
    }
}
