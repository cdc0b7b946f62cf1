use super::{bytes_to_mac_addr, Chip, Connection, ReadEfuse, SpiRegisters, Target};
use crate::error::Error;

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00f0_1d83];

// UART0_BASE_REG + 0x14
const UART_CLKDIV_REG: u32 = 0x3ff4_0014;
const UART_DATE_REG: u32 = 0x3ff4_007c;

/// ESP32 Target
pub struct Esp32;

impl Esp32 {
    /// Check if the magic value matches the chip
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }

    /// Package version from the eFuses
    fn package_version(&self, connection: &mut Connection) -> Result<u32, Error> {
        let word3 = self.read_efuse(connection, 3)?;

        let pkg_version = (word3 >> 9) & 0x7;
        let pkg_version_4bit = (word3 >> 2) & 0x1;

        Ok(pkg_version + (pkg_version_4bit << 3))
    }

    fn chip_revision(&self, connection: &mut Connection) -> Result<u32, Error> {
        let word3 = self.read_efuse(connection, 3)?;
        let word5 = self.read_efuse(connection, 5)?;
        let apb_ctl_date = connection.read_reg(0x3ff6_607c)?;

        let rev_bit0 = (word3 >> 15) & 0x1;
        let rev_bit1 = (word5 >> 20) & 0x1;
        let rev_bit2 = (apb_ctl_date >> 31) & 0x1;

        let combine_value = (rev_bit2 << 2) | (rev_bit1 << 1) | rev_bit0;

        match combine_value {
            1 => Ok(1),
            3 => Ok(2),
            7 => Ok(3),
            _ => Ok(0),
        }
    }
}

impl ReadEfuse for Esp32 {
    fn efuse_reg(&self) -> u32 {
        0x3ff5_a000
    }
}

impl Target for Esp32 {
    fn chip(&self) -> Chip {
        Chip::Esp32
    }

    fn image_chip_id(&self) -> Option<u32> {
        Some(0)
    }

    fn bootloader_flash_offset(&self) -> u32 {
        0x1000
    }

    fn supports_encryption(&self) -> bool {
        // The ESP32 loader rejects the longer Begin form carrying the
        // `encrypted` word
        false
    }

    fn spi_registers(&self) -> SpiRegisters {
        SpiRegisters {
            base: 0x3ff4_2000,
            usr_offset: 0x1c,
            usr1_offset: 0x20,
            usr2_offset: 0x24,
            w0_offset: 0x80,
            mosi_length_offset: Some(0x28),
            miso_length_offset: Some(0x2c),
        }
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        UART_CLKDIV_REG
    }

    fn uart_date_reg(&self) -> u32 {
        UART_DATE_REG
    }

    fn mac_address(&self, connection: &mut Connection) -> Result<String, Error> {
        let mac0 = self.read_efuse(connection, 1)?;
        let mac1 = self.read_efuse(connection, 2)? & 0xffff;

        let bytes = ((mac1 as u64) << 32) | mac0 as u64;
        let bytes = bytes.to_be_bytes();

        Ok(bytes_to_mac_addr(&bytes[2..]))
    }

    fn chip_description(&self, connection: &mut Connection) -> Result<String, Error> {
        let pkg_version = self.package_version(connection)?;
        let revision = self.chip_revision(connection)?;
        let word3 = self.read_efuse(connection, 3)?;
        let single_core = (word3 & 0x1) != 0;

        let name = match pkg_version {
            0 => {
                if single_core {
                    "ESP32-S0WDQ6"
                } else {
                    "ESP32-D0WDQ6"
                }
            }
            1 => {
                if single_core {
                    "ESP32-S0WD"
                } else {
                    "ESP32-D0WD"
                }
            }
            2 => "ESP32-D2WD",
            4 => "ESP32-U4WDH",
            5 => "ESP32-PICO-D4",
            6 => "ESP32-PICO-V3-02",
            _ => "ESP32",
        };

        Ok(format!("{name} (revision {revision})"))
    }

    fn chip_features(&self, connection: &mut Connection) -> Result<Vec<&str>, Error> {
        let word3 = self.read_efuse(connection, 3)?;
        let word4 = self.read_efuse(connection, 4)?;
        let word6 = self.read_efuse(connection, 6)?;

        let mut features = vec!["WiFi"];

        let chip_ver_dis_bt = (word3 >> 1) & 0x1;
        if chip_ver_dis_bt == 0 {
            features.push("BT");
        }

        let chip_ver_dis_app_cpu = word3 & 0x1;
        if chip_ver_dis_app_cpu == 0 {
            features.push("Dual Core");
        } else {
            features.push("Single Core");
        }

        let chip_cpu_freq_rated = (word3 >> 13) & 0x1;
        if chip_cpu_freq_rated != 0 {
            let chip_cpu_freq_low = (word3 >> 12) & 0x1;
            if chip_cpu_freq_low != 0 {
                features.push("160MHz");
            } else {
                features.push("240MHz");
            }
        }

        let pkg_version = self.package_version(connection)?;
        if [2, 4, 5, 6].contains(&pkg_version) {
            features.push("Embedded Flash");
        }
        if pkg_version == 6 {
            features.push("Embedded PSRAM");
        }

        let adc_vref = (word4 >> 8) & 0x1;
        if adc_vref != 0 {
            features.push("VRef calibration in efuse");
        }

        let blk3_part_res = (word3 >> 14) & 0x1;
        if blk3_part_res != 0 {
            features.push("BLK3 partially reserved");
        }

        let coding_scheme = word6 & 0x3;
        features.push(match coding_scheme {
            0 => "Coding Scheme None",
            1 => "Coding Scheme 3/4",
            2 => "Coding Scheme Repeat (UNSUPPORTED)",
            _ => "Coding Scheme Invalid",
        });

        Ok(features)
    }
}
