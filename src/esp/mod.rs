//! Espressif ROM/stub serial loader
//!
//! [`Flasher`] drives the download-mode loader baked into every Espressif
//! part: connection sync and chip detection, optional upload of the RAM
//! flasher stub, SPI flash writes (plain or deflated) with MD5
//! verification, baud-rate changes, and the final reboot.

use std::{io::Write as _, thread::sleep, time::Duration};

use flate2::{write::ZlibEncoder, Compression};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, VariantNames};

use self::{
    command::{Command, CommandType},
    connection::Connection,
    reset::{hard_reset, reset_strategy_sequence},
    stubs::{get_stub, StubProvider, EXPECTED_STUB_HANDSHAKE},
    targets::{Chip, Target, XtalFrequency},
};
use crate::{
    error::{ConnectionError, Error},
    image::Segment,
    port::SerialPort,
    progress::LogSink,
};

pub mod command;
pub mod connection;
mod reset;
pub mod slip;
pub mod stubs;
pub mod targets;

/// Connection attempts before giving up on sync
const DEFAULT_CONNECT_ATTEMPTS: usize = 7;
/// Sync frames sent per reset before trying the next reset variant
const SYNC_FRAMES_PER_RESET: usize = 8;
/// How long we listen for the stub's handshake after starting it
const STUB_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(200);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;
/// Flash write block size of the ROM loader
pub(crate) const FLASH_WRITE_SIZE: usize = 0x400;
/// Flash write block size once the stub is running
pub(crate) const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// RAM upload block size used for the stub itself
pub(crate) const MAX_RAM_BLOCK_SIZE: usize = 0x1800;

/// Magic byte opening every ESP application image header
const IMAGE_HEADER_MAGIC: u8 = 0xE9;

/// Supported flash frequencies
///
/// Note that not all frequencies are supported by each target device.
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashFrequency {
    /// 20 MHz
    #[serde(rename = "20MHz")]
    _20Mhz,
    /// 26 MHz
    #[serde(rename = "26MHz")]
    _26Mhz,
    /// 40 MHz
    #[serde(rename = "40MHz")]
    #[default]
    _40Mhz,
    /// 80 MHz
    #[serde(rename = "80MHz")]
    _80Mhz,
}

/// Supported flash modes
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio,
    /// Quad Output (4 pins used for data)
    Qout,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio,
    /// Dual Output (2 pins used for data)
    Dout,
}

/// Supported flash sizes
///
/// Note that not all sizes are supported by each target device.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashSize {
    /// 256 KB
    #[serde(rename = "256KB")]
    _256Kb,
    /// 512 KB
    #[serde(rename = "512KB")]
    _512Kb,
    /// 1 MB
    #[serde(rename = "1MB")]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    _2Mb,
    /// 4 MB
    #[default]
    #[serde(rename = "4MB")]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    _16Mb,
}

impl FlashSize {
    /// Encodes flash size into the format used by the image header, when
    /// the common encoding covers it
    pub const fn encode_flash_size(self) -> Option<u8> {
        use FlashSize::*;

        match self {
            _1Mb => Some(0),
            _2Mb => Some(1),
            _4Mb => Some(2),
            _8Mb => Some(3),
            _16Mb => Some(4),
            _ => None,
        }
    }
}

/// Flash settings applied to the image header; `None` keeps whatever the
/// image already carries
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FlashSettings {
    /// Flash mode
    pub mode: Option<FlashMode>,
    /// Flash size
    pub size: Option<FlashSize>,
    /// Flash frequency
    #[serde(rename = "frequency")]
    pub freq: Option<FlashFrequency>,
}

/// Options for a flash-write session
#[derive(Debug, Default, Clone, Copy)]
pub struct FlashArgs {
    pub settings: FlashSettings,
    /// Erase the whole chip before writing (stub only)
    pub erase_all: bool,
    /// Deflate images before transfer
    pub compress: bool,
    /// Raise `VerifyFailed` on an MD5 mismatch instead of logging it
    pub strict_md5: bool,
}

/// Information about the connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The chip being used
    pub chip: Chip,
    /// Package / revision description
    pub description: String,
    /// Device features
    pub features: Vec<String>,
    /// The crystal frequency of the chip
    pub crystal_frequency: XtalFrequency,
    /// MAC address
    pub mac_address: String,
}

/// Connect to and flash an Espressif target
pub struct Flasher<'a> {
    connection: Connection,
    chip: Chip,
    is_stub: bool,
    flash_write_size: usize,
    spi_attached: bool,
    log: &'a mut dyn LogSink,
}

impl<'a> Flasher<'a> {
    /// Reset the target into download mode, sync with the loader, and
    /// detect which chip is on the other end.
    pub fn connect(port: Box<dyn SerialPort>, log: &'a mut dyn LogSink) -> Result<Self, Error> {
        Self::connect_with_attempts(port, log, DEFAULT_CONNECT_ATTEMPTS)
    }

    pub fn connect_with_attempts(
        port: Box<dyn SerialPort>,
        log: &'a mut dyn LogSink,
        attempts: usize,
    ) -> Result<Self, Error> {
        let mut connection = Connection::new(port);

        let reset_sequence = reset_strategy_sequence();
        let mut synced = false;

        for (attempt, reset_strategy) in
            std::iter::zip(0..attempts * 2, reset_sequence.iter().cycle())
        {
            debug!("Connect attempt {}", attempt + 1);

            reset_strategy.reset(connection.port_mut())?;

            // The ROM prints a boot banner after reset; drain it before
            // syncing and mine it for the boot mode.
            connection.set_timeout(Duration::from_millis(500))?;
            let banner = connection.drain()?;
            if !banner.is_empty() {
                inspect_boot_banner(&banner);
            }

            for frame in 0..SYNC_FRAMES_PER_RESET {
                match connection.sync() {
                    Ok(()) => {
                        synced = true;
                        break;
                    }
                    Err(e) => {
                        debug!("Sync frame {} failed: {e:#?}", frame + 1);
                        sleep(Duration::from_millis(50));
                    }
                }
            }

            if synced {
                break;
            }
        }

        if !synced {
            return Err(Error::EspNoSync);
        }

        connection.set_timeout(DEFAULT_TIMEOUT)?;

        let magic = connection.detect_magic()?;
        let chip = Chip::from_magic(magic)?;
        info!("Detected chip: {chip} (magic {magic:#010x})");
        log.write_line(&format!("Connecting to {chip}..."));

        Ok(Flasher {
            connection,
            chip,
            is_stub: false,
            flash_write_size: FLASH_WRITE_SIZE,
            spi_attached: false,
            log,
        })
    }

    /// The chip type that the flasher is connected to
    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// Whether the RAM stub has taken over from the ROM loader
    pub fn is_stub(&self) -> bool {
        self.is_stub
    }

    /// Upload the flasher stub to RAM and hand control to it.
    ///
    /// A missing handshake is reported and the session carries on against
    /// the ROM loader; flashing still works, only slower.
    pub fn run_stub(&mut self, provider: &dyn StubProvider) -> Result<(), Error> {
        if self.is_stub {
            return Ok(());
        }

        debug!("Loading flash stub for chip: {:?}", self.chip);
        self.log.write_line("Uploading flasher stub...");

        let stub = get_stub(self.chip, provider)?;

        let (text_addr, text) = stub.text()?;
        debug!("Write {} byte stub text", text.len());
        self.mem_write(text_addr, &text)?;

        let (data_addr, data) = stub.data()?;
        debug!("Write {} byte stub data", data.len());
        self.mem_write(data_addr, &data)?;

        debug!("Finish stub write, entry {:#010x}", stub.entry());
        // The loader acks MEM_END just before it jumps to the stub; losing
        // that ack in the hand-over is normal.
        let result = self
            .connection
            .with_timeout(CommandType::MemEnd.timeout(), |connection| {
                connection.command(Command::MemEnd {
                    no_entry: false,
                    entry: stub.entry(),
                })
            });
        if let Err(e) = result {
            if !e.is_timeout() {
                return Err(e);
            }
        }

        // The running stub announces itself on the wire
        let handshake = self
            .connection
            .with_timeout(STUB_HANDSHAKE_TIMEOUT, |connection| connection.read_packet());

        match handshake {
            Ok(packet) if packet == EXPECTED_STUB_HANDSHAKE.as_bytes() => {
                self.is_stub = true;
                self.flash_write_size = STUB_FLASH_WRITE_SIZE;
                self.log.write_line("Stub running");
                Ok(())
            }
            Ok(packet) => Err(Error::EspStubFailed(format!(
                "unexpected handshake: {packet:02x?}"
            ))),
            Err(_) => {
                warn!("Stub handshake not seen, continuing with the ROM loader");
                self.log
                    .write_line("Stub did not start, falling back to the ROM loader");
                Ok(())
            }
        }
    }

    fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let block_size = MAX_RAM_BLOCK_SIZE;
        let blocks = data.len().div_ceil(block_size);

        self.connection
            .with_timeout(CommandType::MemBegin.timeout(), |connection| {
                connection.command(Command::MemBegin {
                    size: data.len() as u32,
                    blocks: blocks as u32,
                    block_size: block_size as u32,
                    offset: addr,
                })
            })
            .map_err(stub_upload_error)?;

        for (sequence, chunk) in data.chunks(block_size).enumerate() {
            self.connection
                .with_timeout(CommandType::MemData.timeout(), |connection| {
                    connection.command(Command::MemData {
                        data: chunk,
                        pad_to: 4,
                        pad_byte: 0,
                        sequence: sequence as u32,
                    })
                })
                .map_err(stub_upload_error)?;
        }

        Ok(())
    }

    /// Write each pre-addressed image to SPI flash and verify it
    pub fn write_flash(&mut self, files: &[Segment], args: FlashArgs) -> Result<(), Error> {
        self.attach_spi_flash()?;

        if args.erase_all {
            self.erase_flash()?;
        }

        for file in files {
            self.write_one(file, &args)?;
        }

        self.finish(true, args.compress)?;

        Ok(())
    }

    fn attach_spi_flash(&mut self) -> Result<(), Error> {
        // The 8266 ROM has the flash attached from reset
        if self.spi_attached || self.chip == Chip::Esp8266 {
            return Ok(());
        }

        self.connection
            .with_timeout(CommandType::SpiAttach.timeout(), |connection| {
                connection.command(Command::SpiAttach {
                    hspi_arg: 0,
                    rom: !self.is_stub,
                })
            })?;
        self.spi_attached = true;

        Ok(())
    }

    fn write_one(&mut self, file: &Segment, args: &FlashArgs) -> Result<(), Error> {
        let target = self.chip.into_target();

        // Flash is written in words; the gap reads back as erased bytes
        let mut image = file.data.clone();
        while image.len() % 4 != 0 {
            image.push(0xFF);
        }

        if file.addr == target.bootloader_flash_offset() {
            self.patch_image_header(&mut image, &args.settings, target.as_ref())?;
        }

        let mut hasher = Md5::new();
        hasher.update(&image);
        let expected_md5 = hasher.finalize();

        let addr = file.addr;
        let raw_size = image.len() as u32;
        let flash_write_size = self.flash_write_size;

        let payload = if args.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&image).map_err(ConnectionError::IoWrite)?;
            encoder.finish().map_err(ConnectionError::IoWrite)?
        } else {
            image.clone()
        };

        let blocks = payload.len().div_ceil(flash_write_size);
        let erase_size = self.erase_size(addr, raw_size);
        let supports_encryption = target.supports_encryption() && !self.is_stub;

        debug!(
            "Flashing {raw_size} bytes at {addr:#010x} ({} blocks of {flash_write_size})",
            blocks
        );

        self.connection.with_timeout(
            CommandType::FlashBegin.timeout_for_size(erase_size),
            |connection| {
                if args.compress {
                    connection.command(Command::FlashDeflBegin {
                        size: raw_size,
                        blocks: blocks as u32,
                        block_size: flash_write_size as u32,
                        offset: addr,
                        supports_encryption,
                    })
                } else {
                    connection.command(Command::FlashBegin {
                        size: erase_size,
                        blocks: blocks as u32,
                        block_size: flash_write_size as u32,
                        offset: addr,
                        supports_encryption,
                    })
                }
            },
        )?;

        for (sequence, block) in payload.chunks(flash_write_size).enumerate() {
            self.connection.with_timeout(
                CommandType::FlashData.timeout_for_size(flash_write_size as u32),
                |connection| {
                    if args.compress {
                        connection.command(Command::FlashDeflData {
                            data: block,
                            pad_to: 0,
                            pad_byte: 0xFF,
                            sequence: sequence as u32,
                        })
                    } else {
                        connection.command(Command::FlashData {
                            data: block,
                            pad_to: flash_write_size,
                            pad_byte: 0xFF,
                            sequence: sequence as u32,
                        })
                    }
                },
            )?;

            let percent = (sequence + 1) * 100 / blocks;
            self.log
                .write_line(&format!("Writing at {addr:#010x}... ({percent} %)"));
        }

        if self.is_stub {
            // Synchronize: the stub acks data blocks ahead of persisting
            // them
            self.connection.read_reg(connection::CHIP_DETECT_MAGIC_REG_ADDR)?;
        }

        // The 8266 ROM loader cannot hash what it just wrote
        if self.is_stub || self.chip != Chip::Esp8266 {
            self.verify_md5(addr, raw_size, &expected_md5.into(), args.strict_md5)?;
        }

        Ok(())
    }

    fn patch_image_header(
        &mut self,
        image: &mut [u8],
        settings: &FlashSettings,
        target: &dyn Target,
    ) -> Result<(), Error> {
        if settings.mode.is_none() && settings.size.is_none() && settings.freq.is_none() {
            return Ok(());
        }

        if image.len() < 4 || image[0] != IMAGE_HEADER_MAGIC {
            warn!("Image at the bootloader offset has no {IMAGE_HEADER_MAGIC:#04x} header, not patching flash settings");
            return Ok(());
        }

        if let Some(mode) = settings.mode {
            image[2] = mode as u8;
        }

        let mut size_freq = image[3];
        if let Some(size) = settings.size {
            size_freq = (size_freq & 0x0F) | target.flash_size_bits(size)?;
        }
        if let Some(freq) = settings.freq {
            let encodings = target.flash_frequency_encodings();
            let bits = encodings
                .get(&freq)
                .ok_or_else(|| Error::UnsupportedFeature {
                    chip: self.chip.to_string(),
                    feature: format!("a {freq} flash frequency"),
                })?;
            size_freq = (size_freq & 0xF0) | bits;
        }
        image[3] = size_freq;

        Ok(())
    }

    fn erase_size(&self, offset: u32, size: u32) -> u32 {
        // The 8266 ROM erases more than asked unless the head of the region
        // is discounted; the stub and the newer ROMs take the size verbatim.
        if self.chip != Chip::Esp8266 || self.is_stub {
            return size.div_ceil(FLASH_SECTOR_SIZE as u32) * FLASH_SECTOR_SIZE as u32;
        }

        let sector_size = FLASH_SECTOR_SIZE as u32;
        let sectors_per_block = 16;
        let num_sectors = size.div_ceil(sector_size);
        let start_sector = offset / sector_size;

        let head_sectors =
            (sectors_per_block - (start_sector % sectors_per_block)).min(num_sectors);

        if num_sectors < 2 * head_sectors {
            num_sectors.div_ceil(2) * sector_size
        } else {
            (num_sectors - head_sectors) * sector_size
        }
    }

    fn verify_md5(
        &mut self,
        addr: u32,
        size: u32,
        expected: &[u8; 16],
        strict: bool,
    ) -> Result<(), Error> {
        let digest = self.checksum_md5(addr, size)?;
        let expected_value = u128::from_be_bytes(*expected);

        if digest != expected_value {
            warn!(
                "MD5 mismatch at {addr:#010x}: expected {expected_value:032x}, read {digest:032x}"
            );
            self.log.write_line(&format!(
                "Verification failed at {addr:#010x} (MD5 mismatch)"
            ));
            if strict {
                return Err(Error::VerifyFailed { address: addr });
            }
        } else {
            debug!("MD5 OK at {addr:#010x}");
            self.log.write_line("Hash of data verified");
        }

        Ok(())
    }

    fn finish(&mut self, stay_in_loader: bool, compress: bool) -> Result<(), Error> {
        self.connection
            .with_timeout(CommandType::FlashBegin.timeout(), |connection| {
                connection.command(Command::FlashBegin {
                    size: 0,
                    blocks: 0,
                    block_size: FLASH_WRITE_SIZE as u32,
                    offset: 0,
                    supports_encryption: false,
                })
            })?;

        self.connection
            .with_timeout(CommandType::FlashDeflEnd.timeout(), |connection| {
                connection.command(if compress {
                    Command::FlashDeflEnd {
                        reboot: !stay_in_loader,
                    }
                } else {
                    Command::FlashEnd {
                        reboot: !stay_in_loader,
                    }
                })
            })?;

        Ok(())
    }

    /// Get MD5 of a flash region
    pub fn checksum_md5(&mut self, addr: u32, length: u32) -> Result<u128, Error> {
        self.connection.with_timeout(
            CommandType::FlashMd5.timeout_for_size(length),
            |connection| {
                connection
                    .command(Command::FlashMd5 {
                        offset: addr,
                        size: length,
                    })?
                    .try_into()
            },
        )
    }

    /// Change the baud rate of the connection (stub only)
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        if !self.is_stub {
            return Err(Error::UnsupportedFeature {
                chip: self.chip.to_string(),
                feature: "changing the baud rate without the stub".into(),
            });
        }

        debug!("Change baud to: {baud}");

        let prior_baud = self.connection.baud();

        self.connection
            .with_timeout(CommandType::ChangeBaudrate.timeout(), |connection| {
                connection.command(Command::ChangeBaudrate {
                    new_baud: baud,
                    prior_baud,
                })
            })?;
        self.connection.set_baud(baud)?;
        sleep(Duration::from_millis(50));
        self.connection.flush()?;
        self.log.write_line(&format!("Baud rate set to {baud}"));

        Ok(())
    }

    /// Erase the entire flash (stub only)
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        if !self.is_stub {
            return Err(Error::UnsupportedFeature {
                chip: self.chip.to_string(),
                feature: "erasing flash without the stub".into(),
            });
        }

        debug!("Erasing the entire flash");
        self.log.write_line("Erasing flash (this may take a while)...");
        let started = std::time::Instant::now();

        self.connection
            .with_timeout(CommandType::EraseFlash.timeout(), |connection| {
                connection.command(Command::EraseFlash)
            })?;
        sleep(Duration::from_millis(50));
        self.connection.flush()?;

        self.log.write_line(&format!(
            "Chip erase completed in {:.1}s",
            started.elapsed().as_secs_f32()
        ));

        Ok(())
    }

    /// Erase a region of flash (stub only)
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        if !self.is_stub {
            return Err(Error::UnsupportedFeature {
                chip: self.chip.to_string(),
                feature: "erasing a flash region without the stub".into(),
            });
        }

        debug!("Erasing region of {size:#x}B at {offset:#010x}");

        self.connection.with_timeout(
            CommandType::EraseRegion.timeout_for_size(size),
            |connection| connection.command(Command::EraseRegion { offset, size }),
        )?;
        sleep(Duration::from_millis(50));
        self.connection.flush()?;

        Ok(())
    }

    /// Read everything we can about the connected device
    pub fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let target = self.chip.into_target();

        let description = target.chip_description(&mut self.connection)?;
        let features = target
            .chip_features(&mut self.connection)?
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        let crystal_frequency = target.crystal_freq(&mut self.connection)?;
        let mac_address = target.mac_address(&mut self.connection)?;

        Ok(DeviceInfo {
            chip: self.chip,
            description,
            features,
            crystal_frequency,
            mac_address,
        })
    }

    /// Reset the target into the user application
    pub fn reboot(&mut self) -> Result<(), Error> {
        self.log.write_line("Rebooting...");
        hard_reset(self.connection.port_mut())
    }

    /// Give the port back to the caller
    pub fn into_port(self) -> Box<dyn SerialPort> {
        self.connection.into_port()
    }
}

fn stub_upload_error(e: Error) -> Error {
    match e {
        Error::RomError(rom) => Error::EspStubFailed(rom.to_string()),
        other => other,
    }
}

/// Mine the drained boot banner for the boot mode the chip reports
fn inspect_boot_banner(banner: &[u8]) {
    let text = String::from_utf8_lossy(banner);
    let pattern = Regex::new(r"boot:(0x[0-9a-fA-F]+)([\s\S]*waiting for download)?").unwrap();

    if let Some(captures) = pattern.captures(&text) {
        let boot_mode = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let download_mode = captures.get(2).is_some();

        debug!("Boot mode: {boot_mode}");
        debug!("Download mode: {download_mode}");

        if !download_mode {
            warn!("Wrong boot mode detected ({boot_mode}), the chip needs to be in download mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::port::testutil::{Exchange, PortEvent, ScriptedPort};
    use crate::progress::MemorySink;

    /// SLIP-encode a raw frame
    fn slip(frame: &[u8]) -> Vec<u8> {
        let mut out = vec![0xC0];
        for byte in frame {
            match byte {
                0xC0 => out.extend_from_slice(&[0xDB, 0xDC]),
                0xDB => out.extend_from_slice(&[0xDB, 0xDD]),
                b => out.push(*b),
            }
        }
        out.push(0xC0);
        out
    }

    /// Encode a command the way the flasher sends it
    fn request(command: Command<'_>) -> Vec<u8> {
        slip(&command.encode())
    }

    /// A 12-byte ROM-style response with a little-endian value and OK
    /// status
    fn rom_response(op: u8, value: u32) -> Vec<u8> {
        let mut raw = vec![0x01, op, 0x04, 0x00];
        raw.extend_from_slice(&value.to_le_bytes());
        raw.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        slip(&raw)
    }

    fn connect_script(magic: u32) -> Vec<Exchange> {
        vec![
            Exchange::new(request(Command::Sync), rom_response(0x08, 0)),
            Exchange::new(
                request(Command::ReadReg {
                    address: connection::CHIP_DETECT_MAGIC_REG_ADDR,
                }),
                rom_response(0x0A, magic),
            ),
        ]
    }

    #[test]
    fn connect_detects_esp32_from_magic() {
        let port = ScriptedPort::new(115_200, connect_script(0x00f0_1d83));
        let recording = port.recording.clone();
        let mut sink = MemorySink::new();

        let flasher = Flasher::connect(Box::new(port), &mut sink).unwrap();

        assert_eq!(flasher.chip(), Chip::Esp32);
        assert!(!flasher.is_stub());

        // The reset pulse toggled both control lines before any sync
        let recording = recording.lock().unwrap();
        assert!(recording.events.contains(&PortEvent::Dtr(true)));
        assert!(recording.events.contains(&PortEvent::Rts(true)));
        assert_eq!(recording.events.last(), Some(&PortEvent::ClearInput));
    }

    #[test]
    fn connect_detects_esp8266_from_magic() {
        let port = ScriptedPort::new(115_200, connect_script(0xfff0_c101));
        let mut sink = MemorySink::new();

        let flasher = Flasher::connect(Box::new(port), &mut sink).unwrap();

        assert_eq!(flasher.chip(), Chip::Esp8266);
    }

    #[test]
    fn reboot_leaves_both_lines_low() {
        let port = ScriptedPort::new(115_200, connect_script(0x0000_07c6));
        let recording = port.recording.clone();
        let mut sink = MemorySink::new();

        let mut flasher = Flasher::connect(Box::new(port), &mut sink).unwrap();
        flasher.reboot().unwrap();

        let recording = recording.lock().unwrap();
        let last_dtr = recording
            .events
            .iter()
            .rev()
            .find_map(|e| match e {
                PortEvent::Dtr(level) => Some(*level),
                _ => None,
            })
            .unwrap();
        let last_rts = recording
            .events
            .iter()
            .rev()
            .find_map(|e| match e {
                PortEvent::Rts(level) => Some(*level),
                _ => None,
            })
            .unwrap();

        assert!(!last_dtr);
        assert!(!last_rts);
    }

    #[test]
    fn erase_size_is_identity_for_stub_and_modern_roms() {
        let port = ScriptedPort::new(115_200, connect_script(0x00f0_1d83));
        let mut sink = MemorySink::new();
        let flasher = Flasher::connect(Box::new(port), &mut sink).unwrap();

        assert_eq!(flasher.erase_size(0x1000, 0x4000), 0x4000);
        assert_eq!(flasher.erase_size(0x1000, 0x4001), 0x5000);
    }

    #[test]
    fn erase_size_discounts_head_sectors_on_esp8266_rom() {
        let port = ScriptedPort::new(115_200, connect_script(0xfff0_c101));
        let mut sink = MemorySink::new();
        let flasher = Flasher::connect(Box::new(port), &mut sink).unwrap();

        // Writing 0x20000 at offset 0: 32 sectors, 16 head sectors
        assert_eq!(flasher.erase_size(0, 0x20000), 0x10000);
        // Small write entirely inside the head block
        assert_eq!(flasher.erase_size(0, 0x2000), 0x1000);
    }
}
