//! Commands understood by the Espressif ROM and stub loaders

use std::time::Duration;

use strum::Display;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_DEFL_END_TIMEOUT: Duration = Duration::from_secs(10);
const FLASH_MD5_TIMEOUT: Duration = Duration::from_secs(8);

/// Seed for the payload checksum carried by the data commands; every other
/// command sends a zero checksum field.
const CHECKSUM_SEED: u8 = 0xEF;

/// Types of commands that can be sent to a target device
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiAttach = 0x0D,
    // Stub-loader only
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    // Stub-loader only
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFL_END_TIMEOUT,
            CommandType::FlashMd5 => FLASH_MD5_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout scaled to the amount of flash the command touches
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        let per_mb = match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                ERASE_REGION_TIMEOUT_PER_MB
            }
            CommandType::FlashData | CommandType::FlashDeflData => ERASE_WRITE_TIMEOUT_PER_MB,
            _ => return self.timeout(),
        };

        let millis = per_mb.as_millis() as f64 * (size as f64 / 1_000_000.0);

        FLASH_DEFL_END_TIMEOUT.max(Duration::from_millis(millis as u64))
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiAttach {
        hspi_arg: u32,
        /// The ROM loader takes four extra bytes of zeros after the argument
        rom: bool,
    },
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash { .. } => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
        }
    }

    /// Return a timeout based on the size
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    /// Serialize the request packet (before SLIP framing)
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Request::new(self.command_type());

        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                packet.word(size);
                packet.word(blocks);
                packet.word(block_size);
                packet.word(offset);
                // Loaders that predate flash encryption reject the longer
                // form carrying this extra word
                if supports_encryption {
                    packet.word(0);
                }
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::MemData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::FlashDeflData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                packet.block(data, pad_to, pad_byte, sequence);
            }
            Command::FlashEnd { reboot } | Command::FlashDeflEnd { reboot } => {
                // On the wire 0 means reboot, 1 means stay in the loader
                packet.byte(u8::from(!reboot));
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                packet.word(size);
                packet.word(blocks);
                packet.word(block_size);
                packet.word(offset);
            }
            Command::MemEnd { no_entry, entry } => {
                packet.word(u32::from(no_entry));
                packet.word(entry);
            }
            Command::Sync => {
                packet.bytes(&[0x07, 0x07, 0x12, 0x20]);
                packet.bytes(&[0x55; 32]);
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                packet.word(address);
                packet.word(value);
                packet.word(mask.unwrap_or(0xFFFF_FFFF));
                packet.word(0); // delay in microseconds
            }
            Command::ReadReg { address } => {
                packet.word(address);
            }
            Command::SpiAttach { hspi_arg, rom } => {
                packet.word(hspi_arg);
                if rom {
                    packet.word(0);
                }
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                packet.word(new_baud);
                packet.word(prior_baud);
            }
            Command::FlashMd5 { offset, size } => {
                packet.word(offset);
                packet.word(size);
                packet.word(0);
                packet.word(0);
            }
            Command::EraseFlash => {}
            Command::EraseRegion { offset, size } => {
                packet.word(offset);
                packet.word(size);
            }
        }

        packet.finish()
    }
}

/// Accumulates the body of a request packet; the header (direction byte,
/// opcode, body length, checksum word) goes in front once the body is
/// complete.
struct Request {
    op: CommandType,
    checksum: u32,
    body: Vec<u8>,
}

impl Request {
    fn new(op: CommandType) -> Self {
        Request {
            op,
            checksum: 0,
            body: Vec::new(),
        }
    }

    fn byte(&mut self, value: u8) {
        self.body.push(value);
    }

    fn word(&mut self, value: u32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// A data block: the `{size, sequence, 0, 0}` preamble, the payload
    /// padded out to `pad_to`, and the seeded XOR checksum over the padded
    /// payload.
    fn block(&mut self, data: &[u8], pad_to: usize, pad_byte: u8, sequence: u32) {
        let padding = pad_to.saturating_sub(data.len());

        self.word((data.len() + padding) as u32);
        self.word(sequence);
        self.word(0);
        self.word(0);

        let mut checksum = data.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b);
        // An even run of identical pad bytes cancels out of the XOR
        if padding % 2 == 1 {
            checksum ^= pad_byte;
        }
        self.checksum = checksum as u32;

        self.body.extend_from_slice(data);
        self.body.resize(self.body.len() + padding, pad_byte);
    }

    fn finish(self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.body.len() + 8);
        packet.push(0x00); // direction: request
        packet.push(self.op as u8);
        packet.extend_from_slice(&(self.body.len() as u16).to_le_bytes());
        packet.extend_from_slice(&self.checksum.to_le_bytes());
        packet.extend_from_slice(&self.body);

        packet
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sync_frame_layout() {
        let bytes = Command::Sync.encode();

        // direction, opcode, length, zero checksum
        assert_eq!(&bytes[..4], &[0x00, 0x08, 0x24, 0x00]);
        assert_eq!(&bytes[4..8], &[0x00; 4]);
        assert_eq!(&bytes[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert_eq!(&bytes[12..], &[0x55; 32]);
    }

    #[test]
    fn data_checksum_is_seeded() {
        // XOR of payload bytes starting at 0xEF
        let bytes = Command::FlashData {
            data: &[0x01, 0x02],
            pad_to: 0,
            pad_byte: 0xFF,
            sequence: 0,
        }
        .encode();

        let checksum = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(checksum, (0xEFu8 ^ 0x01 ^ 0x02) as u32);
    }

    #[test]
    fn data_checksum_covers_padding() {
        let bytes = Command::FlashData {
            data: &[0x01],
            pad_to: 4,
            pad_byte: 0xFF,
            sequence: 0,
        }
        .encode();

        // Three pad bytes: two cancel, one survives in the XOR
        let checksum = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(checksum, (0xEFu8 ^ 0x01 ^ 0xFF) as u32);

        // The padded payload follows the 16-byte block preamble
        assert_eq!(&bytes[24..], &[0x01, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn read_reg_carries_address() {
        let bytes = Command::ReadReg {
            address: 0x4000_1000,
        }
        .encode();

        assert_eq!(&bytes[..2], &[0x00, 0x0A]);
        assert_eq!(&bytes[8..12], &0x4000_1000u32.to_le_bytes());
    }

    #[test]
    fn rom_flash_begin_omits_encrypted_field() {
        let rom = Command::FlashBegin {
            size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0,
            supports_encryption: false,
        }
        .encode();
        let stub = Command::FlashBegin {
            size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0,
            supports_encryption: true,
        }
        .encode();

        assert_eq!(u16::from_le_bytes(rom[2..4].try_into().unwrap()), 16);
        assert_eq!(u16::from_le_bytes(stub[2..4].try_into().unwrap()), 20);
    }

    #[test]
    fn erase_flash_has_empty_body() {
        assert_eq!(
            Command::EraseFlash.encode(),
            vec![0x00, 0xD0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
