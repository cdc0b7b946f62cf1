//! Catalog of supported CPUs
//!
//! A pure table mapping a CPU identifier to the bootloader protocol that
//! programs it, its flash geometry, the signature the target must report,
//! and (for STK500v2) the ISP timing block forwarded verbatim to the
//! programmer.

use strum::Display;

/// Bootloader protocol spoken by a target's resident bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    /// Classical Atmel STK500 (optiboot and friends)
    Stk500v1,
    /// STK500 version 2 (Mega bootloaders)
    Stk500v2,
    /// LUFA-style USB-CDC bootloaders (butterfly protocol)
    Avr109,
    /// Espressif ROM/stub serial loader
    Esp,
}

/// ISP timing block for `CMD_ENTER_PROGMODE_ISP`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IspTiming {
    pub timeout: u8,
    pub stab_delay: u8,
    pub cmdexe_delay: u8,
    pub synch_loops: u8,
    pub byte_delay: u8,
    pub poll_value: u8,
    pub poll_index: u8,
}

impl IspTiming {
    const fn mega() -> Self {
        IspTiming {
            timeout: 0xC8,
            stab_delay: 0x64,
            cmdexe_delay: 0x19,
            synch_loops: 0x20,
            byte_delay: 0x00,
            poll_value: 0x53,
            poll_index: 0x03,
        }
    }
}

/// One catalog row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuProfile {
    pub name: &'static str,
    pub protocol: Protocol,
    /// Three-byte device signature the target must report (empty for ESP)
    pub signature: &'static [u8],
    /// Flash page size in bytes
    pub page_size: usize,
    pub num_pages: u32,
    /// ISP timing for STK500v2 targets
    pub timing: Option<IspTiming>,
    /// AVR109 device code to select, when the bootloader cares
    pub device_code: Option<u8>,
}

const PROFILES: &[CpuProfile] = &[
    CpuProfile {
        name: "atmega8",
        protocol: Protocol::Stk500v1,
        signature: &[0x1E, 0x93, 0x07],
        page_size: 64,
        num_pages: 128,
        timing: None,
        device_code: None,
    },
    CpuProfile {
        name: "atmega168",
        protocol: Protocol::Stk500v1,
        signature: &[0x1E, 0x94, 0x06],
        page_size: 128,
        num_pages: 128,
        timing: None,
        device_code: None,
    },
    CpuProfile {
        name: "atmega328p",
        protocol: Protocol::Stk500v1,
        signature: &[0x1E, 0x95, 0x0F],
        page_size: 128,
        num_pages: 256,
        timing: None,
        device_code: None,
    },
    CpuProfile {
        name: "atmega1280",
        protocol: Protocol::Stk500v2,
        signature: &[0x1E, 0x97, 0x03],
        page_size: 256,
        num_pages: 512,
        timing: Some(IspTiming::mega()),
        device_code: None,
    },
    CpuProfile {
        name: "atmega2560",
        protocol: Protocol::Stk500v2,
        signature: &[0x1E, 0x98, 0x01],
        page_size: 256,
        num_pages: 1024,
        timing: Some(IspTiming::mega()),
        device_code: None,
    },
    CpuProfile {
        name: "atmega32u4",
        protocol: Protocol::Avr109,
        signature: &[0x1E, 0x95, 0x87],
        page_size: 128,
        num_pages: 256,
        timing: None,
        device_code: Some(0x44),
    },
    CpuProfile {
        name: "esp8266",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        timing: None,
        device_code: None,
    },
    CpuProfile {
        name: "esp32",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        timing: None,
        device_code: None,
    },
    CpuProfile {
        name: "esp32s2",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        timing: None,
        device_code: None,
    },
    CpuProfile {
        name: "esp32s3",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        timing: None,
        device_code: None,
    },
    CpuProfile {
        name: "esp32c3",
        protocol: Protocol::Esp,
        signature: &[],
        page_size: 0x400,
        num_pages: 0,
        timing: None,
        device_code: None,
    },
];

/// Look up the profile for a CPU identifier (e.g. `"atmega328p"`)
pub fn profile(cpu: &str) -> Option<&'static CpuProfile> {
    let cpu = cpu.to_ascii_lowercase();
    PROFILES.iter().find(|p| p.name == cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(profile("ATmega328P").unwrap().name, "atmega328p");
    }

    #[test]
    fn unknown_cpu_is_none() {
        assert!(profile("atmega420").is_none());
    }

    #[test]
    fn mega2560_timing_block() {
        let timing = profile("atmega2560").unwrap().timing.unwrap();
        assert_eq!(timing.stab_delay, 0x64);
        assert_eq!(timing.cmdexe_delay, 0x19);
        assert_eq!(timing.synch_loops, 0x20);
        assert_eq!(timing.poll_value, 0x53);
        assert_eq!(timing.poll_index, 0x03);
    }

    #[test]
    fn geometry_covers_full_flash() {
        let p = profile("atmega2560").unwrap();
        assert_eq!(p.page_size as u32 * p.num_pages, 256 * 1024);

        let p = profile("atmega328p").unwrap();
        assert_eq!(p.page_size as u32 * p.num_pages, 32 * 1024);
    }
}
