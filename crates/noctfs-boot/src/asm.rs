//! A minimal 16-bit real-mode instruction emitter.
//!
//! Only the instructions the boot stub needs are supported. Branches and absolute address
//! operands refer to [`Label`]s and are patched in [`Assembler::finish`], once every label has
//! been bound.

use alloc::vec::Vec;

/// Errors that can occur while assembling
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    /// A label was referenced but never bound
    #[error("Label {0} is referenced but never bound")]
    UnboundLabel(usize),
    /// A short branch cannot reach its target
    #[error("Branch at offset {at:#x} cannot reach its target ({distance} bytes away)")]
    BranchOutOfRange { at: usize, distance: isize },
    /// A label's absolute address does not fit in 16 bits
    #[error("Address of offset {offset:#x} does not fit in 16 bits")]
    AddressOverflow { offset: usize },
    /// Padding was requested to an offset that has already been passed
    #[error("Cannot pad to offset {target:#x}, already at {offset:#x}")]
    Overrun { offset: usize, target: usize },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg16 {
    Ax = 0,
    Cx = 1,
    Dx = 2,
    Bx = 3,
    Sp = 4,
    Bp = 5,
    Si = 6,
    Di = 7,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg8 {
    Al = 0,
    Cl = 1,
    Dl = 2,
    Bl = 3,
    Ah = 4,
    Ch = 5,
    Dh = 6,
    Bh = 7,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
}

impl Reg16 {
    pub const ALL: [Reg16; 8] = [
        Self::Ax,
        Self::Cx,
        Self::Dx,
        Self::Bx,
        Self::Sp,
        Self::Bp,
        Self::Si,
        Self::Di,
    ];

    pub fn from_index(index: u8) -> Self {
        Self::ALL[(index & 0b111) as usize]
    }
}

impl Reg8 {
    pub const ALL: [Reg8; 8] = [
        Self::Al,
        Self::Cl,
        Self::Dl,
        Self::Bl,
        Self::Ah,
        Self::Ch,
        Self::Dh,
        Self::Bh,
    ];

    pub fn from_index(index: u8) -> Self {
        Self::ALL[(index & 0b111) as usize]
    }
}

impl SegReg {
    /// Only the low two bits of the ModRM reg field select a segment register on the 8086
    pub fn from_index(index: u8) -> Self {
        match index & 0b11 {
            0 => Self::Es,
            1 => Self::Cs,
            2 => Self::Ss,
            _ => Self::Ds,
        }
    }
}

/// A ModRM byte with mod=0b11, i.e. both operands are registers
const fn modrm_direct(reg: u8, rm: u8) -> u8 {
    0b1100_0000 | (reg << 3) | rm
}

/// A position in the code, which may not be known yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    /// Signed displacement from the end of the instruction
    Rel8 { next: usize },
    /// Absolute address, load address + label offset
    Abs16,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    at: usize,
    label: Label,
    kind: FixupKind,
}

#[derive(Debug)]
pub struct Assembler {
    origin: u16,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    /// Creates an assembler whose first byte will be loaded at `origin`
    pub fn new(origin: u16) -> Self {
        Self {
            origin,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn origin(&self) -> u16 {
        self.origin
    }

    /// The offset of the next emitted byte
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds the label to the current offset
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    /// The offset a label is bound to, if it has been bound
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    pub fn resolve(&self, label: Label) -> Result<usize, AsmError> {
        self.label_offset(label).ok_or(AsmError::UnboundLabel(label.0))
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emits zeroes until the current offset is `target`
    pub fn pad_to(&mut self, target: usize) -> Result<(), AsmError> {
        let offset = self.code.len();
        if offset > target {
            return Err(AsmError::Overrun { offset, target });
        }
        self.code.resize(target, 0);
        Ok(())
    }

    fn rel8(&mut self, opcode: u8, label: Label) {
        self.code.push(opcode);
        let at = self.code.len();
        self.code.push(0);
        self.fixups.push(Fixup {
            at,
            label,
            kind: FixupKind::Rel8 { next: at + 1 },
        });
    }

    /// `jmp short label`
    pub fn jmp_short(&mut self, label: Label) {
        self.rel8(0xEB, label);
    }

    /// `jz short label`
    pub fn jz_short(&mut self, label: Label) {
        self.rel8(0x74, label);
    }

    /// `jnz short label`
    pub fn jnz_short(&mut self, label: Label) {
        self.rel8(0x75, label);
    }

    /// `mov reg, imm16`
    pub fn mov_r16_imm(&mut self, reg: Reg16, imm: u16) {
        self.code.push(0xB8 + reg as u8);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov reg, label`, loading the label's absolute address
    pub fn mov_r16_addr(&mut self, reg: Reg16, label: Label) {
        self.code.push(0xB8 + reg as u8);
        let at = self.code.len();
        self.code.extend_from_slice(&[0, 0]);
        self.fixups.push(Fixup {
            at,
            label,
            kind: FixupKind::Abs16,
        });
    }

    /// `mov reg, imm8`
    pub fn mov_r8_imm(&mut self, reg: Reg8, imm: u8) {
        self.code.push(0xB0 + reg as u8);
        self.code.push(imm);
    }

    /// `mov sreg, reg`
    pub fn mov_sreg_r16(&mut self, sreg: SegReg, reg: Reg16) {
        self.code.push(0x8E);
        self.code.push(modrm_direct(sreg as u8, reg as u8));
    }

    /// `xor dst, src`
    pub fn xor_r16(&mut self, dst: Reg16, src: Reg16) {
        self.code.push(0x31);
        self.code.push(modrm_direct(src as u8, dst as u8));
    }

    /// `xor dst, src`
    pub fn xor_r8(&mut self, dst: Reg8, src: Reg8) {
        self.code.push(0x30);
        self.code.push(modrm_direct(src as u8, dst as u8));
    }

    /// `or dst, src`
    pub fn or_r8(&mut self, dst: Reg8, src: Reg8) {
        self.code.push(0x08);
        self.code.push(modrm_direct(src as u8, dst as u8));
    }

    /// `lodsb`
    pub fn lodsb(&mut self) {
        self.code.push(0xAC);
    }

    /// `cld`
    pub fn cld(&mut self) {
        self.code.push(0xFC);
    }

    /// `int vector`
    pub fn int(&mut self, vector: u8) {
        self.code.push(0xCD);
        self.code.push(vector);
    }

    /// Resolves all fixups and returns the machine code
    pub fn finish(mut self) -> Result<Vec<u8>, AsmError> {
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label)?;
            match fixup.kind {
                FixupKind::Rel8 { next } => {
                    let distance = target as isize - next as isize;
                    let rel = i8::try_from(distance).map_err(|_| AsmError::BranchOutOfRange {
                        at: fixup.at - 1,
                        distance,
                    })?;
                    self.code[fixup.at] = rel as u8;
                }
                FixupKind::Abs16 => {
                    let address = u16::try_from(self.origin as usize + target)
                        .map_err(|_| AsmError::AddressOverflow { offset: target })?;
                    self.code[fixup.at..fixup.at + 2].copy_from_slice(&address.to_le_bytes());
                }
            }
        }
        log::trace!(
            "Assembled {}b with {} fixups at origin {:#06x}",
            self.code.len(),
            self.fixups.len(),
            self.origin
        );
        Ok(self.code)
    }
}
