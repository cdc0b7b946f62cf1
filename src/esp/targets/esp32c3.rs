use super::{bytes_to_mac_addr, Chip, Connection, ReadEfuse, SpiRegisters, Target};
use crate::error::Error;

/// Two magic values cover the silicon revisions in circulation
const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x6921_506f, 0x1b31_506f];

const UART_CLKDIV_REG: u32 = 0x6000_0014;
const UART_DATE_REG: u32 = 0x6000_007c;

const MAC_WORD: u32 = 17;

/// ESP32-C3 Target
pub struct Esp32c3;

impl Esp32c3 {
    /// Check if the magic value matches the chip
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }

    fn minor_chip_version(&self, connection: &mut Connection) -> Result<u32, Error> {
        let word = self.read_efuse(connection, 22)?;
        Ok((word >> 18) & 0xf)
    }

    fn major_chip_version(&self, connection: &mut Connection) -> Result<u32, Error> {
        let word = self.read_efuse(connection, 22)?;
        Ok((word >> 24) & 0x3)
    }
}

impl ReadEfuse for Esp32c3 {
    fn efuse_reg(&self) -> u32 {
        0x6000_8800
    }
}

impl Target for Esp32c3 {
    fn chip(&self) -> Chip {
        Chip::Esp32c3
    }

    fn image_chip_id(&self) -> Option<u32> {
        Some(5)
    }

    fn bootloader_flash_offset(&self) -> u32 {
        0x0
    }

    fn supports_encryption(&self) -> bool {
        true
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x6000_2000,
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
        let major = self.major_chip_version(connection)?;
        let minor = self.minor_chip_version(connection)?;

        Ok(format!("ESP32-C3 (revision v{major}.{minor})"))
    }

    fn chip_features(&self, _connection: &mut Connection) -> Result<Vec<&str>, Error> {
        Ok(vec!["WiFi", "BLE"])
    }
}
