use super::{bytes_to_mac_addr, Chip, Connection, ReadEfuse, SpiRegisters, Target};
use crate::{error::Error, esp::FlashSize};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xfff0_c101];

const UART_CLKDIV_REG: u32 = 0x6000_0014;
const UART_DATE_REG: u32 = 0x6000_0078;

/// ESP8266 Target
pub struct Esp8266;

impl Esp8266 {
    /// Check if the magic value matches the chip
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl ReadEfuse for Esp8266 {
    fn efuse_reg(&self) -> u32 {
        0x3ff0_0050
    }
}

impl Target for Esp8266 {
    fn chip(&self) -> Chip {
        Chip::Esp8266
    }

    fn image_chip_id(&self) -> Option<u32> {
        None
    }

    fn bootloader_flash_offset(&self) -> u32 {
        0x0
    }

    fn supports_encryption(&self) -> bool {
        false
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x6000_0200,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x40,
            mosi_length_offset: None,
            miso_length_offset: None,
        }
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        UART_CLKDIV_REG
    }

    fn uart_date_reg(&self) -> u32 {
        UART_DATE_REG
    }

    fn xtal_clk_divider(&self) -> u32 {
        2
    }

    fn flash_size_bits(&self, size: FlashSize) -> Result<u8, Error> {
        // The ESP8266 header encoding predates the common table
        let bits = match size {
            FlashSize::_256Kb => 0x10,
            FlashSize::_512Kb => 0x00,
            FlashSize::_1Mb => 0x20,
            FlashSize::_2Mb => 0x30,
            FlashSize::_4Mb => 0x40,
            FlashSize::_8Mb => 0x80,
            FlashSize::_16Mb => 0x90,
            _ => {
                return Err(Error::UnsupportedFeature {
                    chip: self.chip().to_string(),
                    feature: format!("a {size} flash"),
                })
            }
        };

        Ok(bits)
    }

    fn mac_address(&self, connection: &mut Connection) -> Result<String, Error> {
        let mac0 = self.read_efuse(connection, 0)?;
        let mac1 = self.read_efuse(connection, 1)?;
        let mac3 = self.read_efuse(connection, 3)?;

        let oui: [u8; 3] = if mac3 != 0 {
            [
                ((mac3 >> 16) & 0xff) as u8,
                ((mac3 >> 8) & 0xff) as u8,
                (mac3 & 0xff) as u8,
            ]
        } else if (mac1 >> 16) & 0xff == 0 {
            [0x18, 0xfe, 0x34]
        } else if (mac1 >> 16) & 0xff == 1 {
            [0xac, 0xd0, 0x74]
        } else {
            return Err(Error::ChipDetect("unknown OUI in eFuse".into()));
        };

        let mac = [
            oui[0],
            oui[1],
            oui[2],
            ((mac1 >> 8) & 0xff) as u8,
            (mac1 & 0xff) as u8,
            ((mac0 >> 24) & 0xff) as u8,
        ];

        Ok(bytes_to_mac_addr(&mac))
    }

    fn chip_description(&self, connection: &mut Connection) -> Result<String, Error> {
        let word0 = self.read_efuse(connection, 0)?;
        let word2 = self.read_efuse(connection, 2)?;

        let is_8285 = (word0 & (1 << 4)) != 0 || (word2 & (1 << 16)) != 0;

        Ok(if is_8285 { "ESP8285" } else { "ESP8266EX" }.to_string())
    }

    fn chip_features(&self, connection: &mut Connection) -> Result<Vec<&str>, Error> {
        let description = self.chip_description(connection)?;

        let mut features = vec!["WiFi"];
        if description == "ESP8285" {
            features.push("Embedded Flash");
        }

        Ok(features)
    }
}
