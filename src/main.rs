#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use avr_stk500_loader::image::{self, Page};
use avr_stk500_loader::{discover, intel_hex};
use avr_stk500_loader::{CpuInfo, Error, Options, Programmer, Variant};

type Loader = Programmer<Serial, Delay, IoErrorKind>;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to, found by USB id when omitted
    #[structopt(long)]
    port: Option<String>,

    /// Bootloader protocol, stk500v1 (Uno, Nano) or stk500v2 (Mega)
    #[structopt(long, default_value = "stk500v1")]
    programmer: Variant,

    /// Serial port baud rate (57600 for ATmegaBOOT, 115200 for Optiboot / stk500v2)
    #[structopt(long)]
    baud: Option<u32>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Show bootloader and device information
    Info,

    /// Write an Intel HEX image to flash
    Write {
        /// Image to write
        file: PathBuf,

        /// Skip reading back and comparing the written pages
        #[structopt(long)]
        no_verify: bool,

        /// Image is a raw binary starting at address 0
        #[structopt(long)]
        binary: bool,
    },

    /// Read flash into an Intel HEX file
    Read {
        /// Output file
        file: PathBuf,

        /// Bytes to read (defaults to the whole flash)
        #[structopt(long)]
        length: Option<u32>,

        /// Save a raw binary rather than Intel HEX
        #[structopt(long)]
        binary: bool,
    },

    /// Hex dump a range of flash
    Dump {
        /// Start address (page aligned)
        #[structopt(long, default_value = "0")]
        address: u32,

        /// Bytes to dump
        #[structopt(long, default_value = "256")]
        length: u32,
    },
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let port = match &o.port {
        Some(p) => p.clone(),
        None => match discover::find_port() {
            Ok(Some(p)) => p,
            Ok(None) => {
                error!("No board found, specify one with --port");
                return;
            }
            Err(e) => {
                error!("Error listing serial ports: {}", e);
                return;
            }
        },
    };

    info!("Connecting to serial port {}", port);

    let mut p = match Programmer::linux(&port, o.programmer, o.options.clone()) {
        Ok(p) => p,
        Err(e) => {
            println!("Error connecting to serial port: {:?}", e);
            return;
        }
    };

    let baud = o.baud.unwrap_or_else(|| o.programmer.default_baud());
    if let Err(e) = p.open(baud) {
        error!("Could not connect with board at {} baud: {}", baud, e);
        p.close();
        return;
    }

    if let Err(e) = run(&mut p, &o.command) {
        error!("{:?}", e);
    }

    // Leave the bootloader whether or not the command succeeded
    if let Err(e) = p.leave_bootloader() {
        error!("Error leaving bootloader: {}", e);
    }

    p.close();
}

fn run(p: &mut Loader, command: &Command) -> anyhow::Result<()> {
    match p.board_request() {
        Ok(info) => info!(
            "Bootloader: '{}' version: {} hardware version: {}",
            info.name,
            info.sw_version_string(),
            info.hw_version
        ),
        Err(e) => warn!("Board request failed: {}", e),
    }

    let cpu = p.cpu_signature().context("Reading CPU signature")?;
    info!(
        "CPU: {} ({} flash, {} pages of {} bytes)",
        cpu.name,
        bytefmt::format(cpu.flash_size as u64),
        cpu.page_count,
        cpu.page_size
    );

    match command {
        Command::Info => Ok(()),
        Command::Write {
            file,
            no_verify,
            binary,
        } => {
            let data = if *binary {
                std::fs::read(file).with_context(|| format!("Reading {:?}", file))?
            } else {
                let text = std::fs::read_to_string(file)
                    .with_context(|| format!("Reading {:?}", file))?;
                intel_hex::parse(&text, cpu.flash_size)
                    .with_context(|| format!("Parsing {:?}", file))?
            };
            write(p, &cpu, &data, !no_verify)
        }
        Command::Read {
            file,
            length,
            binary,
        } => {
            let length = length.unwrap_or(cpu.flash_size);
            let data = read(p, &cpu, 0, length)?;
            let res = if *binary {
                std::fs::write(file, &data)
            } else {
                std::fs::write(file, intel_hex::encode(&data, 0)?)
            };
            res.with_context(|| format!("Writing {:?}", file))?;
            info!("Saved {} to {:?}", bytefmt::format(data.len() as u64), file);
            Ok(())
        }
        Command::Dump { address, length } => {
            let data = read(p, &cpu, *address, *length)?;
            for (i, line) in data.chunks(16).enumerate() {
                println!("{:05x}: {}", *address as usize + i * 16, hex::encode(line));
            }
            Ok(())
        }
    }
}

fn progress(len: u64, prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );
    bar.set_prefix(prefix);
    bar
}

fn write(p: &mut Loader, cpu: &CpuInfo, data: &[u8], verify: bool) -> anyhow::Result<()> {
    if data.len() > cpu.flash_size as usize {
        return Err(anyhow!(
            "Image ({}) does not fit in {} flash ({})",
            bytefmt::format(data.len() as u64),
            cpu.name,
            bytefmt::format(cpu.flash_size as u64)
        ));
    }

    let pages: Vec<Page> = image::pages(data, cpu.page_size).collect();

    info!("Writing {}", bytefmt::format(data.len() as u64));
    let bar = progress(data.len() as u64, "writing");
    for page in &pages {
        p.write_memory(&page.data, page.address)
            .with_context(|| format!("Writing page at 0x{:05x}", page.address))?;
        bar.inc(page.data.len() as u64);
    }
    bar.finish_with_message("done");

    if !verify {
        return Ok(());
    }

    info!("Reading and verifying flash memory");
    let bar = progress(data.len() as u64, "verifying");
    for page in &pages {
        let read = p
            .read_memory(page.address, page.data.len())
            .with_context(|| format!("Reading page at 0x{:05x}", page.address))?;

        if read != page.data {
            return Err(Error::<IoErrorKind>::VerifyMismatch {
                address: page.address,
            }
            .into());
        }
        bar.inc(page.data.len() as u64);
    }
    bar.finish_with_message("done");

    info!("Flash done");
    Ok(())
}

fn read(p: &mut Loader, cpu: &CpuInfo, address: u32, length: u32) -> anyhow::Result<Vec<u8>> {
    let page_size = cpu.page_size as u32;
    if address % page_size != 0 {
        return Err(anyhow!("Address 0x{:05x} is not page aligned", address));
    }
    let end = address.saturating_add(length).min(cpu.flash_size);

    let total = end.saturating_sub(address);
    let mut data = Vec::with_capacity(total as usize);
    let bar = progress(total as u64, "reading");

    let mut a = address;
    while a < end {
        let len = page_size.min(end - a) as usize;
        let page = p
            .read_memory(a, len)
            .with_context(|| format!("Reading page at 0x{:05x}", a))?;
        data.extend_from_slice(&page);

        bar.inc(len as u64);
        a += page_size;
    }
    bar.finish_with_message("done");

    Ok(data)
}
