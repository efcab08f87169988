use noctfs_boot::asm::SegReg;
use noctfs_boot::emu::{self, FIRST_HARD_DISK, Machine, Step, TeletypeBios};
use noctfs_boot::layout::{DEFAULT_MESSAGE, LOAD_ADDRESS};
use noctfs_boot::{BootImage, BootImageBuilder, verify};
use pretty_assertions::assert_eq;

const STEP_LIMIT: u64 = 10_000;

#[test]
fn reference_image_prints_message_and_halts() {
    let image = BootImage::reference();
    let run = emu::run_boot_sector(image.as_bytes(), STEP_LIMIT).unwrap();

    assert_eq!(String::from_utf8(run.output).unwrap(), DEFAULT_MESSAGE);
    assert_eq!(
        run.outcome.halt_address,
        LOAD_ADDRESS as u32 + image.halt_offset() as u32
    );
}

#[test]
fn halt_loop_is_terminal() {
    let image = BootImage::reference();
    let mut machine = Machine::new(TeletypeBios::new());
    machine.load_boot_sector(image.as_bytes(), FIRST_HARD_DISK);
    let outcome = machine.run(STEP_LIMIT).unwrap();
    let printed = machine.bios().output().len();

    for _ in 0..1000 {
        assert_eq!(
            machine.step(),
            Ok(Step::Halted {
                address: outcome.halt_address
            })
        );
    }
    assert_eq!(machine.pc(), outcome.halt_address);
    assert_eq!(machine.bios().output().len(), printed);
}

#[test]
fn printing_is_independent_of_entry_state() {
    let image = BootImage::reference();
    let baseline = emu::run_boot_sector(image.as_bytes(), STEP_LIMIT).unwrap();

    let mut machine = Machine::new(TeletypeBios::new());
    machine.load_boot_sector(image.as_bytes(), 0x00);
    // Firmware is free to leave DS and the direction flag in any state
    machine.registers_mut().set_seg(SegReg::Ds, 0x0040);
    machine.registers_mut().flags.insert(emu::Flags::DIRECTION);
    let outcome = machine.run(STEP_LIMIT).unwrap();

    assert_eq!(outcome, baseline.outcome);
    assert_eq!(machine.into_bios().into_output(), baseline.output);
}

#[test]
fn repeated_boots_print_the_same() {
    let image = BootImage::reference();
    let first = emu::run_boot_sector(image.as_bytes(), STEP_LIMIT).unwrap();
    let second = emu::run_boot_sector(image.as_bytes(), STEP_LIMIT).unwrap();
    assert_eq!(first, second);
}

#[test]
fn print_loop_runs_once_per_character() {
    let image = BootImage::reference();
    let run = emu::run_boot_sector(image.as_bytes(), STEP_LIMIT).unwrap();
    // entry jump, 4 setup instructions, 7 per printed character, 3 for the terminator, halt
    let len = DEFAULT_MESSAGE.len() as u64;
    assert_eq!(run.outcome.steps, 1 + 4 + 7 * len + 3 + 1);
}

#[test]
fn custom_message_boots() {
    let image = BootImageBuilder::new()
        .message("Missing operating system\r\n")
        .build()
        .unwrap();
    assert!(verify(image.as_bytes()).is_ok());
    let run = emu::run_boot_sector(image.as_bytes(), STEP_LIMIT).unwrap();
    assert_eq!(run.output, b"Missing operating system\r\n");
}

#[test]
fn message_is_terminated_exactly_once() {
    let image = BootImage::reference();
    let bytes = image.as_bytes();
    let text = &bytes[image.message_offset()..];
    let nul = text.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&text[..nul], DEFAULT_MESSAGE.as_bytes());
    assert!(text[..nul].iter().all(|&b| b != 0));
}

#[test]
fn reference_layout_invariants() {
    let image = BootImage::reference();
    let bytes = image.as_bytes();
    assert_eq!(bytes.len(), 512);
    assert_eq!(bytes[510], 0x55);
    assert_eq!(bytes[511], 0xAA);
    assert_eq!(bytes[0], 0xEB);
    assert_eq!(2 + bytes[1] as usize, 0x3D);
    assert!(bytes[2..=0x3C].iter().all(|&b| b == 0));
    assert_eq!(&bytes[image.halt_offset()..image.halt_offset() + 2], &[0xEB, 0xFE]);
}
