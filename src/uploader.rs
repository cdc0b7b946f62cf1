//! The upload entry point
//!
//! Owns the pieces every engine shares: image decoding, engine selection
//! from the tool/CPU pair, the bootloader/upload baud transitions, and
//! restoring the caller's baud rate on whichever port the session ends on.

use std::{str::FromStr, time::{Duration, Instant}};

use log::debug;
use strum::EnumString;

use crate::{
    avr::{avr109, stk500v1, stk500v2},
    cpu::{self, Protocol},
    error::Error,
    esp::{stubs::StubProvider, FlashArgs, Flasher, FlashSettings},
    image::{FirmwareImage, Segment},
    port::{ReconnectFn, SerialPort},
    progress::{LogCrateSink, LogSink, NullSink},
};

/// Upload tools whose behavior this library reproduces
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum Tool {
    #[strum(serialize = "avr", serialize = "avrdude")]
    Avr,
    #[strum(serialize = "esptool", serialize = "esptool_py")]
    Esp,
}

/// Everything a single upload needs
pub struct UploadRequest<'a> {
    /// Tool identifier (`"avr"`, `"avrdude"`, `"esptool"`, `"esptool_py"`)
    pub tool: String,
    /// CPU identifier (`"atmega328p"`, `"esp32"`, ...)
    pub cpu: String,
    /// Intel-HEX source text
    pub hex: Option<String>,
    /// Pre-addressed binary segments (the usual ESP input)
    pub segments: Option<Vec<Segment>>,
    /// Baud rate the bootloader listens on
    pub bootloader_baud: Option<u32>,
    /// Faster baud negotiated for the bulk transfer (ESP stub, AVR109
    /// session speed)
    pub upload_baud: Option<u32>,
    /// ESP image header settings; `None` fields keep the image's values
    pub flash_settings: FlashSettings,
    /// Erase the whole ESP flash before writing
    pub erase_all: bool,
    /// Deflate ESP transfers
    pub compress: bool,
    /// Upload the ESP RAM stub when a provider is available
    pub use_stub: bool,
    /// Emit progress lines
    pub verbose: bool,
    /// Treat an ESP MD5 mismatch as fatal instead of logging it
    pub strict_md5: bool,
    /// Withhold the terminal byte of single-page STK500 images
    pub page_tail_clip: bool,
    /// Progress sink; defaults to the `log` crate when verbose
    pub log: Option<&'a mut dyn LogSink>,
    /// Produces replacement ports after a 1200-baud touch (AVR109)
    pub reconnect: Option<&'a mut ReconnectFn<'a>>,
    /// Retrieves ESP stub blobs
    pub stub_provider: Option<&'a dyn StubProvider>,
}

impl Default for UploadRequest<'_> {
    fn default() -> Self {
        UploadRequest {
            tool: String::new(),
            cpu: String::new(),
            hex: None,
            segments: None,
            bootloader_baud: None,
            upload_baud: None,
            flash_settings: FlashSettings::default(),
            erase_all: false,
            compress: true,
            use_stub: true,
            verbose: false,
            strict_md5: false,
            page_tail_clip: true,
            log: None,
            reconnect: None,
            stub_provider: None,
        }
    }
}

/// The outcome of a successful upload
pub struct UploadResult {
    /// The port the target is reachable on; a different object than the
    /// input when the session went through a reconnect
    pub port: Box<dyn SerialPort>,
    /// Wall-clock duration of the whole session
    pub elapsed: Duration,
}

/// Whether this library can program `cpu` with `tool`
///
/// A pure function of its inputs; no port is touched.
pub fn is_supported(tool: &str, cpu: &str) -> bool {
    let Ok(tool) = Tool::from_str(tool) else {
        return false;
    };
    let Some(profile) = cpu::profile(cpu) else {
        return false;
    };

    match tool {
        Tool::Avr => profile.protocol != Protocol::Esp,
        Tool::Esp => profile.protocol == Protocol::Esp,
    }
}

/// Transfer a firmware image into the target reached through `port` and
/// verify it.
///
/// On success the returned port is configured back to the baud rate it had
/// on entry. On failure the port has been closed.
pub fn upload(
    mut port: Box<dyn SerialPort>,
    mut request: UploadRequest<'_>,
) -> Result<UploadResult, Error> {
    let started = Instant::now();

    // Resolve the whole configuration before the port is touched
    let image = decode_image(&request)?;
    let tool =
        Tool::from_str(&request.tool).map_err(|_| Error::UnsupportedTool(request.tool.clone()))?;
    let profile =
        cpu::profile(&request.cpu).ok_or_else(|| Error::UnknownCpu(request.cpu.clone()))?;

    let protocol_matches = match tool {
        Tool::Avr => profile.protocol != Protocol::Esp,
        Tool::Esp => profile.protocol == Protocol::Esp,
    };
    if !protocol_matches {
        return Err(Error::UnsupportedProtocol {
            tool: request.tool.clone(),
            cpu: request.cpu.clone(),
        });
    }

    let mut null_sink = NullSink;
    let mut fallback_sink = LogCrateSink;
    let sink: &mut dyn LogSink = if request.verbose {
        match request.log.take() {
            Some(sink) => sink,
            None => &mut fallback_sink,
        }
    } else {
        &mut null_sink
    };

    if !port.is_open() {
        port.open()?;
    }

    let original_baud = port.baud_rate();
    if let Some(baud) = request.bootloader_baud {
        if baud != port.baud_rate() {
            debug!("Switching to bootloader baud rate {baud}");
            port.set_baud_rate(baud)?;
        }
    }

    let mut port = match profile.protocol {
        Protocol::Stk500v1 => {
            let options = stk500v1::Options {
                page_tail_clip: request.page_tail_clip,
                ..stk500v1::Options::default()
            };
            let result =
                stk500v1::Stk500v1::new(port.as_mut(), sink, options).bootload(&image.data, profile);
            close_on_error(port, result)?
        }
        Protocol::Stk500v2 => {
            let options = stk500v2::Options {
                page_tail_clip: request.page_tail_clip,
                ..stk500v2::Options::default()
            };
            let result =
                stk500v2::Stk500v2::new(port.as_mut(), sink, options).bootload(&image.data, profile);
            close_on_error(port, result)?
        }
        Protocol::Avr109 => {
            let options = avr109::Options {
                speed: request.upload_baud.unwrap_or(57_600),
                original_baud,
                ..avr109::Options::default()
            };
            avr109::Avr109::new(sink, options).bootload(
                port,
                &image.data,
                profile,
                request.reconnect.take(),
            )?
        }
        Protocol::Esp => {
            let mut flasher = Flasher::connect(port, sink)?;

            if request.use_stub {
                if let Some(provider) = request.stub_provider {
                    flasher.run_stub(provider)?;
                }
            }

            if let Some(baud) = request.upload_baud {
                if flasher.is_stub() {
                    flasher.change_baud(baud)?;
                }
            }

            let files = if image.segments.is_empty() {
                vec![Segment::new(0, image.data.clone())]
            } else {
                image.segments.clone()
            };

            flasher.write_flash(
                &files,
                FlashArgs {
                    settings: request.flash_settings,
                    erase_all: request.erase_all,
                    compress: request.compress,
                    strict_md5: request.strict_md5,
                },
            )?;

            flasher.reboot()?;
            flasher.into_port()
        }
    };

    if port.baud_rate() != original_baud {
        debug!("Restoring baud rate {original_baud}");
        port.set_baud_rate(original_baud)?;
    }

    Ok(UploadResult {
        port,
        elapsed: started.elapsed(),
    })
}

fn close_on_error(
    mut port: Box<dyn SerialPort>,
    result: Result<(), Error>,
) -> Result<Box<dyn SerialPort>, Error> {
    match result {
        Ok(()) => Ok(port),
        Err(e) => {
            let _ = port.close();
            Err(e)
        }
    }
}

fn decode_image(request: &UploadRequest<'_>) -> Result<FirmwareImage, Error> {
    if let Some(hex) = &request.hex {
        FirmwareImage::from_ihex(hex)
    } else if let Some(segments) = &request.segments {
        FirmwareImage::from_segments(segments.clone())
    } else {
        Err(Error::MissingImage)
    }
}
