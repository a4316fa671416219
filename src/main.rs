use std::fs::File;
use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use md380_dfu::progress::MAX_PROGRESS;
use md380_dfu::transport_nusb::NusbTransport;
use md380_dfu::Session;

/// MD-380-family bootloaders enumerate as the stock STMicroelectronics DFU bootloader; this
/// is ST's own DFU USB ID, not something specific to TYT/Retevis/Baofeng.
const DEFAULT_VID: u16 = 0x0483;
const DEFAULT_PID: u16 = 0xdf11;

const DEFAULT_BLOCK_SIZE: u32 = 1024;
const DEFAULT_ERASE_BLOCK_SIZE: u32 = 0x1_0000;

/// Driver CLI for the MD-380 family of DMR radios' vendor DFU protocol.
#[derive(Parser, Debug)]
#[command(name = "md380-dfu", version, about)]
struct Cli {
    #[command(flatten)]
    device: DeviceSpec,

    /// Bytes per DFU transfer, as reported by the radio's bootloader.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Bytes per erasable unit of internal flash.
    #[arg(long, default_value_t = DEFAULT_ERASE_BLOCK_SIZE)]
    erase_block_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
struct DeviceSpec {
    /// USB vendor ID of the radio's bootloader.
    #[arg(long, default_value_t = DEFAULT_VID)]
    vid: u16,

    /// USB product ID of the radio's bootloader.
    #[arg(long, default_value_t = DEFAULT_PID)]
    pid: u16,

    /// Match a specific radio by USB serial number, if more than one is attached.
    #[arg(long)]
    serial: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the codeplug (channels, contacts, zones) out of internal flash.
    ReadCodeplug {
        /// Destination file.
        out: std::path::PathBuf,

        /// Number of bytes to read, must be a multiple of the block size.
        #[arg(long, default_value_t = 256 * 1024)]
        size: u32,
    },

    /// Program the codeplug into internal flash.
    WriteCodeplug {
        /// Source file; its length must be a multiple of the block size.
        file: std::path::PathBuf,
    },

    /// Stream the entire external SPI flash chip to a file.
    ReadSpiFlash {
        /// Destination file.
        out: std::path::PathBuf,
    },

    /// Read the MD-380-family contact database out of SPI flash.
    ReadUsers {
        /// Destination file.
        out: std::path::PathBuf,
    },

    /// Write a contact database image.
    #[command(group(ArgGroup::new("users_format").args(["indexed", "raw", "uv380"])))]
    WriteUsers {
        /// Source file.
        file: std::path::PathBuf,

        /// Treat the file as an already-indexed binary image (no length prefix is added).
        #[arg(long)]
        indexed: bool,

        /// Write the file's bytes verbatim, with no framing at all.
        #[arg(long)]
        raw: bool,

        /// Target a UV-380-family radio, whose database lives in internal flash instead of
        /// SPI flash.
        #[arg(long)]
        uv380: bool,
    },

    /// Program a firmware image. The radio must already be in bootloader mode.
    WriteFirmware {
        /// Source file.
        file: std::path::PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("MD380_DFU_LOG", "info")
            .write_style("MD380_DFU_LOG_STYLE"),
    )
    .init();

    let cli = Cli::parse();

    let transport = cli.device.open().context("opening radio")?;
    let mut session = Session::new(transport, cli.block_size, cli.erase_block_size);
    session.set_progress_callback(Some(Box::new(|counter| {
        CURRENT_BAR.with(|slot| {
            if let Some(bar) = slot.borrow().as_ref() {
                bar.set_position(counter as u64);
            }
        });
        Ok(())
    })));

    match cli.command {
        Command::ReadCodeplug { out, size } => {
            let mut buf = vec![0u8; size as usize];
            with_progress(|| session.read_codeplug(&mut buf))?;
            File::create(&out)
                .with_context(|| format!("creating {}", out.display()))?
                .write_all(&buf)?;
        }
        Command::WriteCodeplug { file } => {
            let buf = read_file(&file)?;
            with_progress(|| session.write_codeplug(&buf))?;
        }
        Command::ReadSpiFlash { out } => {
            let mut writer = File::create(&out).with_context(|| format!("creating {}", out.display()))?;
            with_progress(|| session.read_spi_flash(&mut writer))?;
        }
        Command::ReadUsers { out } => {
            let mut writer = File::create(&out).with_context(|| format!("creating {}", out.display()))?;
            with_progress(|| session.read_md380_users(&mut writer))?;
        }
        Command::WriteUsers { file, indexed, raw, uv380 } => {
            if raw {
                let mut reader = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
                let size = reader.metadata()?.len() as u32;
                with_progress(|| session.write_raw_md380_users(&mut reader, size))?;
            } else if indexed {
                let buf = read_file(&file)?;
                with_progress(|| session.write_md380_indexed_users(&buf))?;
            } else if uv380 {
                let buf = read_file(&file)?;
                with_progress(|| session.write_uv380_users(&buf))?;
            } else {
                let buf = read_file(&file)?;
                with_progress(|| session.write_md380_users(&buf))?;
            }
        }
        Command::WriteFirmware { file } => {
            let mut reader = File::open(&file).with_context(|| format!("opening {}", file.display()))?;
            with_progress(|| session.write_firmware(&mut reader))?;
        }
    }

    session.close();
    Ok(())
}

fn read_file(path: &std::path::Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .read_to_end(&mut buf)?;
    Ok(buf)
}

thread_local! {
    static CURRENT_BAR: std::cell::RefCell<Option<ProgressBar>> = const { std::cell::RefCell::new(None) };
}

/// Install a fresh progress bar for the duration of `op`, then tear it down. The session's
/// progress callback is installed once in `main`, long before any particular bar exists, so
/// it reaches whichever bar is current through the thread-local rather than capturing one
/// directly.
fn with_progress<T>(op: impl FnOnce() -> Result<T, md380_dfu::Error>) -> Result<T> {
    let bar = ProgressBar::new(MAX_PROGRESS as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {percent}% ({eta})").unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    CURRENT_BAR.with(|slot| *slot.borrow_mut() = Some(bar.clone()));

    let result = op();

    CURRENT_BAR.with(|slot| *slot.borrow_mut() = None);
    match &result {
        Ok(_) => bar.finish_and_clear(),
        Err(_) => bar.abandon(),
    }
    result.map_err(Into::into)
}

impl DeviceSpec {
    fn open(&self) -> Result<NusbTransport> {
        let candidates: Vec<_> = nusb::list_devices()
            .context("listing USB devices")?
            .filter(|info| info.vendor_id() == self.vid && info.product_id() == self.pid)
            .filter(|info| match &self.serial {
                Some(serial) => info.serial_number() == Some(serial.as_str()),
                None => true,
            })
            .collect();

        let info = match candidates.as_slice() {
            [] => bail!(
                "no radio found matching vid={:#06x} pid={:#06x}{}",
                self.vid,
                self.pid,
                self.serial.as_ref().map(|s| format!(" serial={s}")).unwrap_or_default()
            ),
            [single] => single,
            _ => bail!("multiple radios match; narrow with --serial"),
        };

        let device = info.open().context("opening device")?;
        let interface = device.claim_interface(0).context("claiming interface 0")?;

        Ok(NusbTransport::new(device, interface))
    }
}
