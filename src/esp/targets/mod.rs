//! Supported Espressif target devices
//!
//! Each chip is a static descriptor: detection magic, SPI register layout,
//! flash header encodings, and the eFuse-derived identity operations
//! (MAC address, package/revision description, feature list).

use std::collections::HashMap;

use log::warn;
use strum::{Display, EnumIter, EnumString, VariantNames};

use self::{esp32::Esp32, esp32c3::Esp32c3, esp32s2::Esp32s2, esp32s3::Esp32s3, esp8266::Esp8266};
use super::{connection::Connection, FlashFrequency, FlashSize};
use crate::error::Error;

mod esp32;
mod esp32c3;
mod esp32s2;
mod esp32s3;
mod esp8266;

const UART_CLKDIV_MASK: u32 = 0xfffff;

/// Supported crystal frequencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum XtalFrequency {
    /// 26 MHz
    #[strum(serialize = "26 MHz")]
    _26Mhz,
    /// 40 MHz
    #[strum(serialize = "40 MHz")]
    _40Mhz,
}

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP8266
    Esp8266,
    /// ESP32
    Esp32,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
    /// ESP32-C3, ESP8685
    Esp32c3,
}

impl Chip {
    /// Identify a [Chip] from the magic word read at the detection register
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        if Esp8266::has_magic_value(magic) {
            Ok(Chip::Esp8266)
        } else if Esp32::has_magic_value(magic) {
            Ok(Chip::Esp32)
        } else if Esp32s2::has_magic_value(magic) {
            Ok(Chip::Esp32s2)
        } else if Esp32s3::has_magic_value(magic) {
            Ok(Chip::Esp32s3)
        } else if Esp32c3::has_magic_value(magic) {
            Ok(Chip::Esp32c3)
        } else {
            Err(Error::ChipDetect(format!(
                "unrecognized magic value: {magic:#x}"
            )))
        }
    }

    /// Convert a [Chip] to a [Target]
    pub fn into_target(&self) -> Box<dyn Target> {
        match self {
            Chip::Esp8266 => Box::new(Esp8266),
            Chip::Esp32 => Box::new(Esp32),
            Chip::Esp32s2 => Box::new(Esp32s2),
            Chip::Esp32s3 => Box::new(Esp32s3),
            Chip::Esp32c3 => Box::new(Esp32c3),
        }
    }
}

/// SPI register addresses
#[derive(Debug)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    /// Address of the command register (the block base)
    pub fn cmd(&self) -> u32 {
        self.base
    }

    /// Address of the USR register
    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    /// Address of the USR1 register
    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    /// Address of the USR2 register
    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    /// Address of the W0 register
    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    /// Address of the MOSI length register
    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    /// Address of the MISO length register
    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// Enable the reading of eFuses for a target
pub trait ReadEfuse {
    /// Returns the base address of the eFuse register block
    fn efuse_reg(&self) -> u32;

    /// Read the raw word `word` of the eFuse block
    fn read_efuse(&self, connection: &mut Connection, word: u32) -> Result<u32, Error> {
        connection.read_reg(self.efuse_reg() + word * 0x4)
    }
}

/// Operations for interacting with supported target devices
pub trait Target: ReadEfuse {
    /// The associated [Chip] for the implementing target
    fn chip(&self) -> Chip;

    /// Chip ID carried in application image headers, absent on parts that
    /// predate the field
    fn image_chip_id(&self) -> Option<u32>;

    /// Flash offset the second-stage bootloader is written to
    fn bootloader_flash_offset(&self) -> u32;

    /// Whether the loader's Begin commands take the trailing `encrypted`
    /// word
    fn supports_encryption(&self) -> bool;

    /// SPI register addresses for the chip
    fn spi_registers(&self) -> SpiRegisters;

    /// Address of the UART clock-divider register
    fn uart_clkdiv_reg(&self) -> u32;

    /// Address of the UART date (version) register
    fn uart_date_reg(&self) -> u32;

    /// Divider between the crystal and the UART clock
    fn xtal_clk_divider(&self) -> u32 {
        1
    }

    /// Numeric encodings for the flash frequencies supported by the chip
    fn flash_frequency_encodings(&self) -> HashMap<FlashFrequency, u8> {
        use FlashFrequency::*;

        let encodings = [(_20Mhz, 0x2), (_26Mhz, 0x1), (_40Mhz, 0x0), (_80Mhz, 0xf)];

        HashMap::from(encodings)
    }

    /// High-nibble contribution of the flash size to image header byte 3
    fn flash_size_bits(&self, size: FlashSize) -> Result<u8, Error> {
        let bits = size
            .encode_flash_size()
            .ok_or_else(|| Error::UnsupportedFeature {
                chip: self.chip().to_string(),
                feature: format!("a {size} flash"),
            })?;

        Ok(bits << 4)
    }

    /// Read the factory MAC address from eFuse
    fn mac_address(&self, connection: &mut Connection) -> Result<String, Error>;

    /// Human-readable package / revision description
    fn chip_description(&self, connection: &mut Connection) -> Result<String, Error>;

    /// Enumerate the chip's features, read from eFuse
    fn chip_features(&self, connection: &mut Connection) -> Result<Vec<&str>, Error>;

    /// Estimate the crystal frequency from the UART clock divider
    fn crystal_freq(&self, connection: &mut Connection) -> Result<XtalFrequency, Error> {
        let uart_div = connection.read_reg(self.uart_clkdiv_reg())? & UART_CLKDIV_MASK;
        let est_xtal = (connection.baud() * uart_div) / 1_000_000 / self.xtal_clk_divider();
        let norm_xtal = if est_xtal > 33 {
            XtalFrequency::_40Mhz
        } else {
            XtalFrequency::_26Mhz
        };

        let norm_mhz = match norm_xtal {
            XtalFrequency::_40Mhz => 40,
            XtalFrequency::_26Mhz => 26,
        };
        if est_xtal.abs_diff(norm_mhz) > norm_mhz / 4 {
            warn!("Unsupported crystal frequency detected (~{est_xtal} MHz), assuming {norm_xtal}");
        }

        Ok(norm_xtal)
    }
}

/// Format eFuse-derived MAC bytes as colon-separated hex
pub(crate) fn bytes_to_mac_addr(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_values_identify_every_chip() {
        assert_eq!(Chip::from_magic(0xfff0_c101).unwrap(), Chip::Esp8266);
        assert_eq!(Chip::from_magic(0x00f0_1d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0x0000_07c6).unwrap(), Chip::Esp32s2);
        assert_eq!(Chip::from_magic(0x0000_0009).unwrap(), Chip::Esp32s3);
        assert_eq!(Chip::from_magic(0x6921_506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x1b31_506f).unwrap(), Chip::Esp32c3);
        assert!(Chip::from_magic(0xdead_beef).is_err());
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            bytes_to_mac_addr(&[0x24, 0x0a, 0xc4, 0x00, 0x01, 0x10]),
            "24:0a:c4:00:01:10"
        );
    }

    #[test]
    fn spi_register_layouts() {
        let esp32 = Chip::Esp32.into_target().spi_registers();
        assert_eq!(esp32.cmd(), 0x3ff4_2000);
        assert_eq!(esp32.usr(), 0x3ff4_201c);
        assert_eq!(esp32.w0(), 0x3ff4_2080);
        assert_eq!(esp32.mosi_length(), Some(0x3ff4_2028));

        let esp8266 = Chip::Esp8266.into_target().spi_registers();
        assert_eq!(esp8266.cmd(), 0x6000_0200);
        assert_eq!(esp8266.w0(), 0x6000_0240);
        assert_eq!(esp8266.mosi_length(), None);

        let esp32c3 = Chip::Esp32c3.into_target().spi_registers();
        assert_eq!(esp32c3.usr2(), 0x6000_2020);
        assert_eq!(esp32c3.miso_length(), Some(0x6000_2028));
    }

    #[test]
    fn image_chip_ids() {
        assert_eq!(Chip::Esp8266.into_target().image_chip_id(), None);
        assert_eq!(Chip::Esp32.into_target().image_chip_id(), Some(0));
        assert_eq!(Chip::Esp32s2.into_target().image_chip_id(), Some(2));
        assert_eq!(Chip::Esp32s3.into_target().image_chip_id(), Some(9));
        assert_eq!(Chip::Esp32c3.into_target().image_chip_id(), Some(5));
    }

    #[test]
    fn bootloader_offsets() {
        assert_eq!(
            Chip::Esp8266.into_target().bootloader_flash_offset(),
            0x0000
        );
        assert_eq!(Chip::Esp32.into_target().bootloader_flash_offset(), 0x1000);
        assert_eq!(
            Chip::Esp32s2.into_target().bootloader_flash_offset(),
            0x1000
        );
        assert_eq!(
            Chip::Esp32s3.into_target().bootloader_flash_offset(),
            0x0000
        );
        assert_eq!(
            Chip::Esp32c3.into_target().bootloader_flash_offset(),
            0x0000
        );
    }
}
