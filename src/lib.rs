//! Serial bootloader engines for flashing AVR and Espressif
//! micro-controllers
//!
//! Four protocol engines sit behind one [`upload`] entry point: STK500v1
//! (classic Arduino boards), STK500v2 (the Megas), AVR109 (USB-CDC boards
//! like the Leonardo), and the Espressif ROM/stub loader (ESP8266 and the
//! ESP32 family). The caller supplies a [`SerialPort`] capability and a
//! firmware image; the dispatcher picks the engine from the tool/CPU pair,
//! drives the session, and hands the port back with its original baud rate.
//!
//! The library performs no device discovery, owns no CLI, and keeps no
//! state on disk.

pub mod avr;
pub mod cpu;
pub mod error;
pub mod esp;
pub mod image;
pub mod port;
pub mod progress;

mod uploader;

pub use error::Error;
pub use image::{FirmwareImage, Segment};
pub use port::{ModemStatus, ReconnectFn, ReconnectParams, SerialPort};
#[cfg(feature = "serialport")]
pub use port::NativePort;
pub use progress::LogSink;
pub use uploader::{is_supported, upload, Tool, UploadRequest, UploadResult};
