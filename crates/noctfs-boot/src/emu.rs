//! A tiny real-mode 8086 interpreter, enough to run a boot sector to its halt loop.
//!
//! Only the instructions listed in [`Machine::step`] are decoded; anything else stops execution
//! with [`EmuError::UnsupportedOpcode`]. Interrupts are not vectored through the IVT, they are
//! handed to a [`Bios`] implementation instead.

use alloc::{boxed::Box, vec, vec::Vec};
use bitflags::bitflags;

use crate::asm::{Reg16, Reg8, SegReg};
use crate::layout::{LOAD_ADDRESS, SECTOR_SIZE};

/// 1MiB, the A20 line is off
pub const MEMORY_SIZE: usize = 1 << 20;

/// The drive number BIOS passes in DL for the first hard disk
pub const FIRST_HARD_DISK: u8 = 0x80;

/// Errors that stop the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmuError {
    #[error("Unsupported opcode {opcode:#04x} at {cs:04x}:{ip:04x}")]
    UnsupportedOpcode { opcode: u8, cs: u16, ip: u16 },
    /// Only register to register forms are decoded
    #[error("Unsupported ModRM {modrm:#04x} for opcode {opcode:#04x}")]
    UnsupportedOperand { opcode: u8, modrm: u8 },
    #[error("Unhandled interrupt {vector:#04x} (AH={ah:#04x})")]
    UnhandledInterrupt { vector: u8, ah: u8 },
    #[error("No halt reached within {0} steps")]
    StepLimit(u64),
}

bitflags! {
    /// The FLAGS register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u16 {
        const CARRY = 1 << 0;
        const PARITY = 1 << 2;
        const AUX_CARRY = 1 << 4;
        const ZERO = 1 << 6;
        const SIGN = 1 << 7;
        const TRAP = 1 << 8;
        const INTERRUPT = 1 << 9;
        const DIRECTION = 1 << 10;
        const OVERFLOW = 1 << 11;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    gpr: [u16; 8],
    seg: [u16; 4],
    pub ip: u16,
    pub flags: Flags,
}

impl Registers {
    pub fn reg16(&self, reg: Reg16) -> u16 {
        self.gpr[reg as usize]
    }

    pub fn set_reg16(&mut self, reg: Reg16, value: u16) {
        self.gpr[reg as usize] = value;
    }

    /// AL..BL are the low bytes of AX..BX, AH..BH the high bytes
    pub fn reg8(&self, reg: Reg8) -> u8 {
        let index = reg as usize;
        let word = self.gpr[index & 0b11];
        if index < 4 {
            word as u8
        } else {
            (word >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, reg: Reg8, value: u8) {
        let index = reg as usize;
        let word = &mut self.gpr[index & 0b11];
        if index < 4 {
            *word = (*word & 0xFF00) | value as u16;
        } else {
            *word = (*word & 0x00FF) | ((value as u16) << 8);
        }
    }

    pub fn seg(&self, seg: SegReg) -> u16 {
        self.seg[seg as usize]
    }

    pub fn set_seg(&mut self, seg: SegReg, value: u16) {
        self.seg[seg as usize] = value;
    }
}

/// Linear address of `segment:offset`, wrapped at 1MiB
pub fn linear(segment: u16, offset: u16) -> u32 {
    (((segment as u32) << 4) + offset as u32) & (MEMORY_SIZE as u32 - 1)
}

/// Firmware services reachable through `int`
pub trait Bios {
    fn interrupt(&mut self, vector: u8, regs: &mut Registers) -> Result<(), EmuError>;
}

/// A BIOS that only knows INT 0x10 teletype output, and records what was printed
#[derive(Debug, Clone, Default)]
pub struct TeletypeBios {
    output: Vec<u8>,
}

impl TeletypeBios {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output
    }
}

impl Bios for TeletypeBios {
    fn interrupt(&mut self, vector: u8, regs: &mut Registers) -> Result<(), EmuError> {
        let ah = regs.reg8(Reg8::Ah);
        match (vector, ah) {
            (0x10, 0x0E) => {
                let ch = regs.reg8(Reg8::Al);
                log::trace!("Teletype output {:?}", ch as char);
                self.output.push(ch);
                Ok(())
            }
            _ => Err(EmuError::UnhandledInterrupt { vector, ah }),
        }
    }
}

/// What a single step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The instruction at this linear address jumps to itself, or is a `hlt`
    Halted { address: u32 },
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Linear address of the halt instruction
    pub halt_address: u32,
    /// Instructions executed, including the first execution of the halt instruction
    pub steps: u64,
}

pub struct Machine<B: Bios> {
    regs: Registers,
    memory: Box<[u8]>,
    bios: B,
    steps: u64,
}

impl<B: Bios> core::fmt::Debug for Machine<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("regs", &self.regs)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl<B: Bios> Machine<B> {
    pub fn new(bios: B) -> Self {
        Self {
            regs: Registers::default(),
            memory: vec![0u8; MEMORY_SIZE].into_boxed_slice(),
            bios,
            steps: 0,
        }
    }

    /// Places a boot sector at 0000:7C00 and points CS:IP at it, as firmware does
    pub fn load_boot_sector(&mut self, sector: &[u8; SECTOR_SIZE], drive: u8) {
        let start = LOAD_ADDRESS as usize;
        self.memory[start..start + SECTOR_SIZE].copy_from_slice(sector);
        self.regs.set_seg(SegReg::Cs, 0);
        self.regs.ip = LOAD_ADDRESS;
        self.regs.set_reg8(Reg8::Dl, drive);
        log::debug!("Loaded boot sector at {LOAD_ADDRESS:#06x}, drive {drive:#04x}");
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn bios(&self) -> &B {
        &self.bios
    }

    pub fn into_bios(self) -> B {
        self.bios
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Linear address of CS:IP
    pub fn pc(&self) -> u32 {
        linear(self.regs.seg(SegReg::Cs), self.regs.ip)
    }

    fn fetch8(&mut self) -> u8 {
        let byte = self.memory[self.pc() as usize];
        self.regs.ip = self.regs.ip.wrapping_add(1);
        byte
    }

    fn fetch16(&mut self) -> u16 {
        let lo = self.fetch8();
        let hi = self.fetch8();
        u16::from_le_bytes([lo, hi])
    }

    /// Decodes a register-direct ModRM byte into (reg, rm)
    fn modrm_direct(&mut self, opcode: u8) -> Result<(u8, u8), EmuError> {
        let modrm = self.fetch8();
        if modrm >> 6 != 0b11 {
            return Err(EmuError::UnsupportedOperand { opcode, modrm });
        }
        Ok(((modrm >> 3) & 0b111, modrm & 0b111))
    }

    fn set_logic_flags(&mut self, value: u16, sign_bit: u16) {
        let flags = &mut self.regs.flags;
        flags.remove(Flags::CARRY | Flags::OVERFLOW);
        flags.set(Flags::ZERO, value == 0);
        flags.set(Flags::SIGN, value & sign_bit != 0);
        flags.set(Flags::PARITY, (value as u8).count_ones() % 2 == 0);
    }

    /// Jumps to `target`, reporting a halt if that is the instruction's own address
    fn jump(&mut self, target: u16, instruction: u16) -> Step {
        self.regs.ip = target;
        if target == instruction {
            Step::Halted { address: self.pc() }
        } else {
            Step::Continue
        }
    }

    /// Executes one instruction
    pub fn step(&mut self) -> Result<Step, EmuError> {
        let cs = self.regs.seg(SegReg::Cs);
        let ip = self.regs.ip;
        let opcode = self.fetch8();
        self.steps += 1;

        let step = match opcode {
            0x90 => Step::Continue,
            // jmp rel8
            0xEB => {
                let rel = self.fetch8() as i8;
                self.jump(self.regs.ip.wrapping_add_signed(rel as i16), ip)
            }
            // jmp rel16
            0xE9 => {
                let rel = self.fetch16();
                self.jump(self.regs.ip.wrapping_add(rel), ip)
            }
            // jz / jnz rel8
            0x74 | 0x75 => {
                let rel = self.fetch8() as i8;
                let zero = self.regs.flags.contains(Flags::ZERO);
                if zero == (opcode == 0x74) {
                    self.jump(self.regs.ip.wrapping_add_signed(rel as i16), ip)
                } else {
                    Step::Continue
                }
            }
            // xor r/m16, r16
            0x31 => {
                let (reg, rm) = self.modrm_direct(opcode)?;
                let (dst, src) = (Reg16::from_index(rm), Reg16::from_index(reg));
                let value = self.regs.reg16(dst) ^ self.regs.reg16(src);
                self.regs.set_reg16(dst, value);
                self.set_logic_flags(value, 0x8000);
                Step::Continue
            }
            // or / xor / test r/m8, r8
            0x08 | 0x30 | 0x84 => {
                let (reg, rm) = self.modrm_direct(opcode)?;
                let dst = self.regs.reg8(Reg8::from_index(rm));
                let src = self.regs.reg8(Reg8::from_index(reg));
                let value = match opcode {
                    0x08 => dst | src,
                    0x30 => dst ^ src,
                    _ => dst & src,
                };
                if opcode != 0x84 {
                    self.regs.set_reg8(Reg8::from_index(rm), value);
                }
                self.set_logic_flags(value as u16, 0x80);
                Step::Continue
            }
            // mov sreg, r16
            0x8E => {
                let (reg, rm) = self.modrm_direct(opcode)?;
                let sreg = SegReg::from_index(reg);
                if sreg == SegReg::Cs {
                    return Err(EmuError::UnsupportedOperand {
                        opcode,
                        modrm: 0b1100_0000 | (reg << 3) | rm,
                    });
                }
                let value = self.regs.reg16(Reg16::from_index(rm));
                self.regs.set_seg(sreg, value);
                Step::Continue
            }
            // mov r8, imm8
            0xB0..=0xB7 => {
                let imm = self.fetch8();
                self.regs.set_reg8(Reg8::from_index(opcode - 0xB0), imm);
                Step::Continue
            }
            // mov r16, imm16
            0xB8..=0xBF => {
                let imm = self.fetch16();
                self.regs.set_reg16(Reg16::from_index(opcode - 0xB8), imm);
                Step::Continue
            }
            // lodsb
            0xAC => {
                let si = self.regs.reg16(Reg16::Si);
                let byte = self.memory[linear(self.regs.seg(SegReg::Ds), si) as usize];
                self.regs.set_reg8(Reg8::Al, byte);
                let si = if self.regs.flags.contains(Flags::DIRECTION) {
                    si.wrapping_sub(1)
                } else {
                    si.wrapping_add(1)
                };
                self.regs.set_reg16(Reg16::Si, si);
                Step::Continue
            }
            // int imm8
            0xCD => {
                let vector = self.fetch8();
                self.bios.interrupt(vector, &mut self.regs)?;
                Step::Continue
            }
            0xFA => {
                self.regs.flags.remove(Flags::INTERRUPT);
                Step::Continue
            }
            0xFB => {
                self.regs.flags.insert(Flags::INTERRUPT);
                Step::Continue
            }
            0xFC => {
                self.regs.flags.remove(Flags::DIRECTION);
                Step::Continue
            }
            0xFD => {
                self.regs.flags.insert(Flags::DIRECTION);
                Step::Continue
            }
            // hlt, stay on the instruction
            0xF4 => {
                self.regs.ip = ip;
                Step::Halted {
                    address: linear(cs, ip),
                }
            }
            _ => {
                self.regs.ip = ip;
                return Err(EmuError::UnsupportedOpcode { opcode, cs, ip });
            }
        };
        Ok(step)
    }

    /// Steps until the machine halts, at most `step_limit` instructions
    pub fn run(&mut self, step_limit: u64) -> Result<Outcome, EmuError> {
        let start = self.steps;
        while self.steps - start < step_limit {
            if let Step::Halted { address } = self.step()? {
                log::debug!(
                    "Halted at {address:#07x} after {} steps",
                    self.steps - start
                );
                return Ok(Outcome {
                    halt_address: address,
                    steps: self.steps - start,
                });
            }
        }
        Err(EmuError::StepLimit(step_limit))
    }
}

/// The result of running a boot sector on a [`TeletypeBios`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub output: Vec<u8>,
    pub outcome: Outcome,
}

/// Boots `sector` from the first hard disk and runs it until it halts
pub fn run_boot_sector(sector: &[u8; SECTOR_SIZE], step_limit: u64) -> Result<Execution, EmuError> {
    let mut machine = Machine::new(TeletypeBios::new());
    machine.load_boot_sector(sector, FIRST_HARD_DISK);
    let outcome = machine.run(step_limit)?;
    Ok(Execution {
        output: machine.into_bios().into_output(),
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with(code: &[u8]) -> Machine<TeletypeBios> {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..code.len()].copy_from_slice(code);
        let mut machine = Machine::new(TeletypeBios::new());
        machine.load_boot_sector(&sector, FIRST_HARD_DISK);
        machine
    }

    #[test]
    fn byte_registers_alias_words() {
        let mut regs = Registers::default();
        regs.set_reg16(Reg16::Bx, 0x1234);
        assert_eq!(regs.reg8(Reg8::Bl), 0x34);
        assert_eq!(regs.reg8(Reg8::Bh), 0x12);
        regs.set_reg8(Reg8::Bh, 0xAB);
        assert_eq!(regs.reg16(Reg16::Bx), 0xAB34);
    }

    #[test]
    fn linear_address_wraps() {
        assert_eq!(linear(0x0000, 0x7C00), 0x7C00);
        assert_eq!(linear(0x07C0, 0x0000), 0x7C00);
        assert_eq!(linear(0xFFFF, 0x0010), 0x00000);
    }

    #[test]
    fn load_sets_entry_state() {
        let machine = machine_with(&[0xF4]);
        assert_eq!(machine.pc(), 0x7C00);
        assert_eq!(machine.registers().reg8(Reg8::Dl), FIRST_HARD_DISK);
    }

    #[test]
    fn hlt_halts_in_place() {
        let mut machine = machine_with(&[0x90, 0xF4]);
        let outcome = machine.run(10).unwrap();
        assert_eq!(outcome, Outcome { halt_address: 0x7C01, steps: 2 });
        assert_eq!(machine.step(), Ok(Step::Halted { address: 0x7C01 }));
    }

    #[test]
    fn near_jump_to_self_halts() {
        let mut machine = machine_with(&[0xE9, 0xFD, 0xFF]);
        assert_eq!(machine.step(), Ok(Step::Halted { address: 0x7C00 }));
    }

    #[test]
    fn conditional_jumps_follow_zero_flag() {
        // xor ax, ax; jnz +1; nop; jz -2 (to itself)
        let mut machine = machine_with(&[0x31, 0xC0, 0x75, 0x01, 0x90, 0x74, 0xFE]);
        let outcome = machine.run(10).unwrap();
        assert_eq!(outcome.halt_address, 0x7C05);
        assert!(machine.registers().flags.contains(Flags::ZERO));
        assert!(machine.registers().flags.contains(Flags::PARITY));
    }

    #[test]
    fn lodsb_honours_direction_flag() {
        // mov si, 0x7c10; std; lodsb; lodsb; hlt
        let mut code = [0u8; 0x12];
        code[..7].copy_from_slice(&[0xBE, 0x10, 0x7C, 0xFD, 0xAC, 0xAC, 0xF4]);
        code[0x0F] = b'a';
        code[0x10] = b'b';
        let mut machine = machine_with(&code);
        machine.run(10).unwrap();
        assert_eq!(machine.registers().reg8(Reg8::Al), b'a');
        assert_eq!(machine.registers().reg16(Reg16::Si), 0x7C0E);
    }

    #[test]
    fn teletype_is_recorded() {
        // mov ax, 0x0e41; int 0x10; hlt
        let mut machine = machine_with(&[0xB8, 0x41, 0x0E, 0xCD, 0x10, 0xF4]);
        machine.run(10).unwrap();
        assert_eq!(machine.bios().output(), b"A");
    }

    #[test]
    fn other_bios_services_are_rejected() {
        // mov ah, 0x00; int 0x16
        let mut machine = machine_with(&[0xB4, 0x00, 0xCD, 0x16]);
        assert_eq!(
            machine.run(10),
            Err(EmuError::UnhandledInterrupt { vector: 0x16, ah: 0x00 })
        );
    }

    #[test]
    fn unsupported_opcode_stops_at_the_instruction() {
        let mut machine = machine_with(&[0x90, 0x0F, 0x01]);
        assert_eq!(
            machine.run(10),
            Err(EmuError::UnsupportedOpcode { opcode: 0x0F, cs: 0, ip: 0x7C01 })
        );
        assert_eq!(machine.pc(), 0x7C01);
    }

    #[test]
    fn memory_operands_are_rejected() {
        // xor [bx+si], ax
        let mut machine = machine_with(&[0x31, 0x00]);
        assert_eq!(
            machine.step(),
            Err(EmuError::UnsupportedOperand { opcode: 0x31, modrm: 0x00 })
        );
    }

    #[test]
    fn step_limit_is_reported() {
        // An endless loop of two instructions never jumps to itself
        let mut machine = machine_with(&[0x90, 0xEB, 0xFD]);
        assert_eq!(machine.run(100), Err(EmuError::StepLimit(100)));
        assert_eq!(machine.steps(), 100);
    }

    #[test]
    fn mov_to_cs_is_rejected() {
        let mut machine = machine_with(&[0x8E, 0xC8]);
        assert!(matches!(
            machine.step(),
            Err(EmuError::UnsupportedOperand { opcode: 0x8E, .. })
        ));
    }
}
