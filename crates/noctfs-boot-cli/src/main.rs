use anyhow::{Context, bail};
use clap::Parser;
use noctfs_boot::layout::{CODE_OFFSET, RESERVED_RANGE, SECTOR_SIZE, SIGNATURE_OFFSET};
use noctfs_boot::{BootImage, BootImageBuilder, InstallOptions, emu};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Build and inspect the NoctFS boot sector")]
pub struct Args {
    /// Log everything the library does
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum Command {
    /// Write a fresh 512-byte boot image
    Build(BuildArgs),
    /// Check sector 0 of an image against the boot sector layout
    Verify(InputArgs),
    /// Write the boot sector to sector 0 of a device or disk image
    Install(InstallArgs),
    /// Boot sector 0 of an image in the emulator and print what it displays
    Run(RunArgs),
    /// Hex dump sector 0 of an image
    Dump(InputArgs),
}

#[derive(Debug, Clone, Parser)]
pub struct BuildArgs {
    #[arg(short, long)]
    output: PathBuf,
    /// Text printed at boot instead of the default
    #[arg(short, long)]
    message: Option<String>,
}

#[derive(Debug, Clone, Parser)]
pub struct InputArgs {
    input: PathBuf,
}

#[derive(Debug, Clone, Parser)]
pub struct InstallArgs {
    device: PathBuf,
    #[arg(short, long)]
    message: Option<String>,
    /// Keep the MBR partition table already on the device
    #[arg(long)]
    preserve_partition_table: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    input: PathBuf,
    /// Give up if the sector has not halted after this many instructions
    #[arg(long, default_value_t = 100_000)]
    steps: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::WARN
        })
        .with_writer(std::io::stderr)
        .init();

    match args.cmd {
        Command::Build(args) => build(args),
        Command::Verify(args) => verify(&args.input),
        Command::Install(args) => install(args),
        Command::Run(args) => run(&args.input, args.steps),
        Command::Dump(args) => dump(&args.input),
    }
}

fn build_image(message: Option<&str>) -> anyhow::Result<BootImage> {
    let mut builder = BootImageBuilder::new();
    if let Some(message) = message {
        builder = builder.message(message);
    }
    builder.build().context("Failed to build boot image")
}

fn read_sector(path: &Path) -> anyhow::Result<[u8; SECTOR_SIZE]> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    noctfs_boot::read_boot_sector(&mut file)
        .with_context(|| format!("Failed to read the boot sector of {}", path.display()))
}

fn build(args: BuildArgs) -> anyhow::Result<()> {
    let image = build_image(args.message.as_deref())?;
    std::fs::write(&args.output, image.as_bytes())
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    tracing::info!("Wrote {:?} to {}", image, args.output.display());
    Ok(())
}

fn verify(input: &Path) -> anyhow::Result<()> {
    let sector = read_sector(input)?;
    let report = noctfs_boot::verify(&sector);
    if let Some(message) = report.message() {
        println!("Message: {:?}", String::from_utf8_lossy(message));
    }
    println!("{report}");
    if !report.is_ok() {
        bail!(
            "{} is not a valid boot sector ({} violation(s))",
            input.display(),
            report.violations().len()
        );
    }
    Ok(())
}

fn install(args: InstallArgs) -> anyhow::Result<()> {
    let image = build_image(args.message.as_deref())?;
    let mut device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&args.device)
        .with_context(|| format!("Failed to open {}", args.device.display()))?;
    let options =
        InstallOptions::default().with_preserve_partition_table(args.preserve_partition_table);
    noctfs_boot::install(&mut device, &image, options)
        .with_context(|| format!("Failed to install to {}", args.device.display()))?;
    println!("Installed boot sector to {}", args.device.display());
    Ok(())
}

fn run(input: &Path, steps: u64) -> anyhow::Result<()> {
    let sector = read_sector(input)?;
    let run = emu::run_boot_sector(&sector, steps).context("Emulation stopped")?;
    println!("{}", String::from_utf8_lossy(&run.output));
    println!(
        "Halted at {:#07x} after {} instructions",
        run.outcome.halt_address, run.outcome.steps
    );
    Ok(())
}

/// Names the part of the sector `offset` falls in, in more detail if the sector is one of ours
fn region(offset: usize, image: Option<&BootImage>) -> &'static str {
    if offset < RESERVED_RANGE.start {
        return "entry";
    } else if offset < CODE_OFFSET {
        return "reserved";
    } else if offset >= SIGNATURE_OFFSET {
        return "signature";
    }
    match image {
        Some(image) if offset < image.message_offset() => "code",
        Some(image) if offset < image.padding_offset() => "message",
        Some(_) => "padding",
        None => "body",
    }
}

fn dump(input: &Path) -> anyhow::Result<()> {
    let sector = read_sector(input)?;
    let image = BootImage::from_bytes(&sector)
        .inspect_err(|err| tracing::warn!("Not a NoctFS boot sector: {err}"))
        .ok();
    let region = |i| region(i, image.as_ref());
    for (row, chunk) in sector.chunks(16).enumerate() {
        let offset = row * 16;
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        // Name the regions that start on this row
        let starts: Vec<&str> = (offset..offset + chunk.len())
            .filter(|&i| i == 0 || region(i) != region(i - 1))
            .map(region)
            .collect();
        println!("{offset:04x}  {}  |{ascii:<16}|  {}", hex.join(" "), starts.join(", "));
    }
    Ok(())
}
