use super::{bytes_to_mac_addr, Chip, Connection, ReadEfuse, SpiRegisters, Target};
use crate::error::Error;

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_07c6];

const UART_CLKDIV_REG: u32 = 0x3f40_0014;
const UART_DATE_REG: u32 = 0x3f40_007c;

// Factory MAC words inside the eFuse block
const MAC_WORD: u32 = 17;

/// ESP32-S2 Target
pub struct Esp32s2;

impl Esp32s2 {
    /// Check if the magic value matches the chip
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }

    fn package_version(&self, connection: &mut Connection) -> Result<u32, Error> {
        let word = self.read_efuse(connection, 4)?;
        Ok(word & 0xf)
    }
}

impl ReadEfuse for Esp32s2 {
    fn efuse_reg(&self) -> u32 {
        0x3f41_a000
    }
}

impl Target for Esp32s2 {
    fn chip(&self) -> Chip {
        Chip::Esp32s2
    }

    fn image_chip_id(&self) -> Option<u32> {
        Some(2)
    }

    fn bootloader_flash_offset(&self) -> u32 {
        0x1000
    }

    fn supports_encryption(&self) -> bool {
        true
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x3f40_2000,
            usr_offset: 0x18,
            usr1_offset: 0x1c,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: Some(0x24),
            miso_length_offset: Some(0x28),
        }
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        UART_CLKDIV_REG
    }

    fn uart_date_reg(&self) -> u32 {
        UART_DATE_REG
    }

    fn mac_address(&self, connection: &mut Connection) -> Result<String, Error> {
        let mac0 = self.read_efuse(connection, MAC_WORD)?;
        let mac1 = self.read_efuse(connection, MAC_WORD + 1)? & 0xffff;

        let bytes = ((mac1 as u64) << 32) | mac0 as u64;
        let bytes = bytes.to_be_bytes();

        Ok(bytes_to_mac_addr(&bytes[2..]))
    }

    fn chip_description(&self, connection: &mut Connection) -> Result<String, Error> {
        let name = match self.package_version(connection)? {
            0 => "ESP32-S2",
            1 => "ESP32-S2FH2",
            2 => "ESP32-S2FH4",
            102 => "ESP32-S2FNR2",
            100 => "ESP32-S2R2",
            _ => "ESP32-S2",
        };

        Ok(name.to_string())
    }

    fn chip_features(&self, connection: &mut Connection) -> Result<Vec<&str>, Error> {
        let mut features = vec!["WiFi"];

        match self.package_version(connection)? {
            1 => features.extend(["Embedded Flash 2MB"]),
            2 => features.extend(["Embedded Flash 4MB"]),
            102 => features.extend(["Embedded Flash 2MB", "Embedded PSRAM 2MB"]),
            100 => features.extend(["Embedded PSRAM 2MB"]),
            _ => {}
        }

        Ok(features)
    }
}
