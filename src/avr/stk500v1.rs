//! STK500 version 1 bootloader client
//!
//! The protocol spoken by optiboot and the classic Arduino bootloaders:
//! raw command bytes terminated by `SYNC_CRC_EOP`, replies bracketed by
//! `INSYNC`/`OK`.

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    cpu::CpuProfile,
    error::{ConnectionError, Error},
    port::SerialPort,
    progress::LogSink,
};

const RESP_STK_OK: u8 = 0x10;
const RESP_STK_INSYNC: u8 = 0x14;
const SYNC_CRC_EOP: u8 = 0x20;

const CMD_STK_GET_SYNC: u8 = 0x30;
const CMD_STK_SET_DEVICE: u8 = 0x42;
const CMD_STK_ENTER_PROGMODE: u8 = 0x50;
const CMD_STK_LEAVE_PROGMODE: u8 = 0x51;
const CMD_STK_LOAD_ADDRESS: u8 = 0x55;
const CMD_STK_PROG_PAGE: u8 = 0x64;
const CMD_STK_READ_PAGE: u8 = 0x74;
const CMD_STK_READ_SIGN: u8 = 0x75;

/// Memory type selector for flash ('F')
const MEMTYPE_FLASH: u8 = 0x46;

/// `SET_DEVICE` carries this many parameter bytes
const DEVICE_PARAM_LEN: usize = 20;
/// Offset of the page-size word inside the `SET_DEVICE` parameters
const DEVICE_PARAM_PAGE_SIZE: usize = 12;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(400);
/// Sync rounds performed before the session is trusted
const SYNC_ROUNDS: usize = 3;
/// Send attempts per sync round
const SYNC_ATTEMPTS: usize = 3;
/// Settle time between page operations
const PAGE_YIELD: Duration = Duration::from_millis(4);
/// Upper bound on any reply we are prepared to buffer
const MAX_REPLY: usize = 1024;

/// Session options beyond what the CPU profile carries
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Per-command receive timeout
    pub timeout: Duration,
    /// Withhold the terminal byte of images that fit in a single page,
    /// matching the behavior of the classic host tools
    pub page_tail_clip: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            timeout: DEFAULT_TIMEOUT,
            page_tail_clip: true,
        }
    }
}

/// STK500v1 protocol engine
pub struct Stk500v1<'a> {
    port: &'a mut dyn SerialPort,
    log: &'a mut dyn LogSink,
    options: Options,
}

impl<'a> Stk500v1<'a> {
    pub fn new(port: &'a mut dyn SerialPort, log: &'a mut dyn LogSink, options: Options) -> Self {
        Stk500v1 { port, log, options }
    }

    /// Program and verify `image`, leaving the bootloader on both success
    /// and failure paths.
    pub fn bootload(&mut self, image: &[u8], profile: &CpuProfile) -> Result<(), Error> {
        self.reset_target()?;
        self.sync()?;
        self.verify_signature(profile.signature)?;
        self.set_device(profile.page_size)?;
        self.enter_progmode()?;

        let mut result = self.upload(image, profile.page_size);
        if result.is_ok() {
            result = self.verify(image, profile.page_size);
        }

        // Leave programming mode even when the session failed
        let left = self.leave_progmode();

        result.and(left)
    }

    /// Pulse DTR/RTS to reset the target into its bootloader
    fn reset_target(&mut self) -> Result<(), Error> {
        debug!("Resetting target via DTR/RTS");

        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(false)?;

        sleep(Duration::from_millis(250));

        self.port.write_data_terminal_ready(true)?;
        self.port.write_request_to_send(true)?;

        sleep(Duration::from_millis(50));

        Ok(())
    }

    /// Establish sync with the bootloader, belt-and-braces style: several
    /// full rounds, each retried on silence.
    fn sync(&mut self) -> Result<(), Error> {
        for _ in 0..SYNC_ROUNDS {
            self.get_sync(SYNC_ATTEMPTS)?;
        }

        self.log.write_line("Bootloader in sync");

        Ok(())
    }

    fn get_sync(&mut self, attempts: usize) -> Result<(), Error> {
        match self.command_ok(&[CMD_STK_GET_SYNC]) {
            Err(e) if e.is_timeout() && attempts > 1 => {
                debug!("No sync reply, retrying ({} attempts left)", attempts - 1);
                self.get_sync(attempts - 1)
            }
            other => other,
        }
    }

    fn verify_signature(&mut self, expected: &[u8]) -> Result<(), Error> {
        let reply = self.command(&[CMD_STK_READ_SIGN], 5)?;
        let found = &reply[1..4];

        if found != expected {
            return Err(Error::SignatureMismatch {
                expected: expected.to_vec(),
                found: found.to_vec(),
            });
        }

        debug!("Device signature OK: {found:02x?}");

        Ok(())
    }

    fn set_device(&mut self, page_size: usize) -> Result<(), Error> {
        let mut frame = vec![0u8; DEVICE_PARAM_LEN + 1];
        frame[0] = CMD_STK_SET_DEVICE;
        frame[1 + DEVICE_PARAM_PAGE_SIZE] = (page_size >> 8) as u8;
        frame[1 + DEVICE_PARAM_PAGE_SIZE + 1] = (page_size & 0xFF) as u8;

        self.command_ok(&frame)
    }

    fn enter_progmode(&mut self) -> Result<(), Error> {
        self.command_ok(&[CMD_STK_ENTER_PROGMODE])
    }

    fn leave_progmode(&mut self) -> Result<(), Error> {
        self.command_ok(&[CMD_STK_LEAVE_PROGMODE])
    }

    fn upload(&mut self, image: &[u8], page_size: usize) -> Result<(), Error> {
        self.log
            .write_line(&format!("Writing {} bytes to flash...", image.len()));

        let mut page_addr = 0usize;
        while page_addr < image.len() {
            let page = page_slice(image, page_addr, page_size, self.options.page_tail_clip);
            if page.is_empty() {
                break;
            }

            self.load_address(page_addr)?;

            let mut frame = Vec::with_capacity(page.len() + 4);
            frame.push(CMD_STK_PROG_PAGE);
            frame.push((page.len() >> 8) as u8);
            frame.push((page.len() & 0xFF) as u8);
            frame.push(MEMTYPE_FLASH);
            frame.extend_from_slice(page);

            self.command_ok(&frame)?;

            page_addr += page_size;
            sleep(PAGE_YIELD);
        }

        Ok(())
    }

    fn verify(&mut self, image: &[u8], page_size: usize) -> Result<(), Error> {
        self.log.write_line("Verifying flash...");

        let mut page_addr = 0usize;
        while page_addr < image.len() {
            let page = page_slice(image, page_addr, page_size, self.options.page_tail_clip);
            if page.is_empty() {
                break;
            }

            self.load_address(page_addr)?;

            let frame = [
                CMD_STK_READ_PAGE,
                (page.len() >> 8) as u8,
                (page.len() & 0xFF) as u8,
                MEMTYPE_FLASH,
            ];
            let reply = self.command(&frame, page.len() + 2)?;

            if &reply[1..1 + page.len()] != page {
                return Err(Error::VerifyFailed {
                    address: page_addr as u32,
                });
            }

            page_addr += page_size;
            sleep(PAGE_YIELD);
        }

        self.log.write_line("Flash verified");

        Ok(())
    }

    /// Load the word address for the next page operation
    fn load_address(&mut self, byte_addr: usize) -> Result<(), Error> {
        let word_addr = (byte_addr >> 1) as u16;

        self.command_ok(&[
            CMD_STK_LOAD_ADDRESS,
            (word_addr & 0xFF) as u8,
            (word_addr >> 8) as u8,
        ])
    }

    /// Send a command frame and expect a bare `INSYNC`/`OK` reply
    fn command_ok(&mut self, data: &[u8]) -> Result<(), Error> {
        let reply = self.command(data, 2)?;

        if reply != [RESP_STK_INSYNC, RESP_STK_OK] {
            return Err(ConnectionError::ProtocolMismatch(format!(
                "expected INSYNC/OK, got {reply:02x?}"
            ))
            .into());
        }

        Ok(())
    }

    /// Send a command frame and receive a reply of `reply_len` bytes
    fn command(&mut self, data: &[u8], reply_len: usize) -> Result<Vec<u8>, Error> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.extend_from_slice(data);
        frame.push(SYNC_CRC_EOP);

        self.port.write_all(&frame)?;

        let reply = self.recv(reply_len)?;

        if reply[reply_len - 1] != RESP_STK_OK {
            return Err(ConnectionError::ProtocolMismatch(format!(
                "reply not terminated by OK: {reply:02x?}"
            ))
            .into());
        }

        Ok(reply)
    }

    /// Receive a framed reply: scan for the first `INSYNC`, then accumulate
    /// until `len` bytes are in hand.
    fn recv(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if len > MAX_REPLY {
            return Err(ConnectionError::FramingOverflow.into());
        }

        let deadline = Instant::now() + self.options.timeout;

        // Discard line noise until the sync marker shows up
        let mut byte = [0u8; 1];
        loop {
            self.read_some(&mut byte, deadline)?;
            if byte[0] == RESP_STK_INSYNC {
                break;
            }
        }

        let mut reply = vec![0u8; len];
        reply[0] = RESP_STK_INSYNC;

        let mut filled = 1;
        while filled < len {
            filled += self.read_some(&mut reply[filled..], deadline)?;
        }

        Ok(reply)
    }

    fn read_some(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, Error> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(ConnectionError::ReceiveTimeout(Default::default()))?;
        self.port.set_timeout(remaining)?;

        match self.port.read(buf) {
            Ok(0) => Err(ConnectionError::ReceiveTimeout(Default::default()).into()),
            Ok(n) => Ok(n),
            Err(e) => Err(ConnectionError::from(e).into()),
        }
    }
}

/// Slice one page out of the image.
///
/// Images that fit in a single page have their terminal byte withheld when
/// `tail_clip` is set; multi-page images are sliced plainly, with a short
/// final page.
fn page_slice(image: &[u8], page_addr: usize, page_size: usize, tail_clip: bool) -> &[u8] {
    let end = if image.len() > page_size {
        usize::min(page_addr + page_size, image.len())
    } else if tail_clip {
        image.len().saturating_sub(1)
    } else {
        image.len()
    };

    &image[page_addr..end.max(page_addr)]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cpu;
    use crate::port::testutil::{Exchange, PortEvent, ScriptedPort};
    use crate::progress::MemorySink;

    const OK: [u8; 2] = [RESP_STK_INSYNC, RESP_STK_OK];

    fn eop(data: &[u8]) -> Vec<u8> {
        let mut frame = data.to_vec();
        frame.push(SYNC_CRC_EOP);
        frame
    }

    fn set_device_frame(page_size: u16) -> Vec<u8> {
        let mut frame = vec![0u8; DEVICE_PARAM_LEN + 1];
        frame[0] = CMD_STK_SET_DEVICE;
        frame[13] = (page_size >> 8) as u8;
        frame[14] = (page_size & 0xFF) as u8;
        eop(&frame)
    }

    /// The full wire script for flashing `image` into an ATmega328P
    fn uno_script(image: &[u8]) -> Vec<Exchange> {
        let mut script = Vec::new();

        for _ in 0..3 {
            script.push(Exchange::new(eop(&[CMD_STK_GET_SYNC]), OK));
        }

        script.push(Exchange::new(
            eop(&[CMD_STK_READ_SIGN]),
            [RESP_STK_INSYNC, 0x1E, 0x95, 0x0F, RESP_STK_OK],
        ));
        script.push(Exchange::new(set_device_frame(128), OK));
        script.push(Exchange::new(eop(&[CMD_STK_ENTER_PROGMODE]), OK));

        // Program phase
        for (i, page) in image.chunks(128).enumerate() {
            let word_addr = (i * 64) as u16;
            script.push(Exchange::new(
                eop(&[
                    CMD_STK_LOAD_ADDRESS,
                    (word_addr & 0xFF) as u8,
                    (word_addr >> 8) as u8,
                ]),
                OK,
            ));

            let mut prog = vec![CMD_STK_PROG_PAGE, 0x00, 0x80, MEMTYPE_FLASH];
            prog.extend_from_slice(page);
            script.push(Exchange::new(eop(&prog), OK));
        }

        // Verify phase
        for (i, page) in image.chunks(128).enumerate() {
            let word_addr = (i * 64) as u16;
            script.push(Exchange::new(
                eop(&[
                    CMD_STK_LOAD_ADDRESS,
                    (word_addr & 0xFF) as u8,
                    (word_addr >> 8) as u8,
                ]),
                OK,
            ));

            let mut reply = vec![RESP_STK_INSYNC];
            reply.extend_from_slice(page);
            reply.push(RESP_STK_OK);
            script.push(Exchange::new(
                eop(&[CMD_STK_READ_PAGE, 0x00, 0x80, MEMTYPE_FLASH]),
                reply,
            ));
        }

        script.push(Exchange::new(eop(&[CMD_STK_LEAVE_PROGMODE]), OK));

        script
    }

    #[test]
    fn flashes_and_verifies_an_uno_image() {
        let image: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let mut port = ScriptedPort::new(115_200, uno_script(&image));
        let recording = port.recording.clone();
        let mut sink = MemorySink::new();

        let profile = cpu::profile("atmega328p").unwrap();
        let started = Instant::now();

        Stk500v1::new(&mut port, &mut sink, Options::default())
            .bootload(&image, profile)
            .unwrap();

        // Eight 4 ms page yields per phase put a floor under the elapsed
        // time
        assert!(started.elapsed() >= Duration::from_millis(32));

        // The session opened with the DTR/RTS reset pulse
        let events = recording.lock().unwrap();
        assert_eq!(
            &events.events[..4],
            &[
                PortEvent::Dtr(false),
                PortEvent::Rts(false),
                PortEvent::Dtr(true),
                PortEvent::Rts(true),
            ]
        );
    }

    #[test]
    fn signature_mismatch_aborts_before_programming() {
        let mut script = Vec::new();
        for _ in 0..3 {
            script.push(Exchange::new(eop(&[CMD_STK_GET_SYNC]), OK));
        }
        // An ATmega168 answers where a 328P was expected
        script.push(Exchange::new(
            eop(&[CMD_STK_READ_SIGN]),
            [RESP_STK_INSYNC, 0x1E, 0x94, 0x06, RESP_STK_OK],
        ));

        let mut port = ScriptedPort::new(115_200, script);
        let mut sink = MemorySink::new();
        let profile = cpu::profile("atmega328p").unwrap();

        let result = Stk500v1::new(&mut port, &mut sink, Options::default())
            .bootload(&[0u8; 256], profile);

        assert!(matches!(result, Err(Error::SignatureMismatch { .. })));
    }

    #[test]
    fn sync_retries_on_silence() {
        let mut script = vec![
            // First GET_SYNC goes unanswered
            Exchange::new(eop(&[CMD_STK_GET_SYNC]), vec![]),
            Exchange::new(eop(&[CMD_STK_GET_SYNC]), OK.to_vec()),
            Exchange::new(eop(&[CMD_STK_GET_SYNC]), OK.to_vec()),
            Exchange::new(eop(&[CMD_STK_GET_SYNC]), OK.to_vec()),
        ];
        // Stop the session right after sync with a signature mismatch
        script.push(Exchange::new(
            eop(&[CMD_STK_READ_SIGN]),
            vec![RESP_STK_INSYNC, 0x00, 0x00, 0x00, RESP_STK_OK],
        ));

        let mut port = ScriptedPort::new(115_200, script);
        let mut sink = MemorySink::new();
        let profile = cpu::profile("atmega328p").unwrap();

        let mut options = Options::default();
        options.timeout = Duration::from_millis(20);

        let result =
            Stk500v1::new(&mut port, &mut sink, options).bootload(&[0u8; 256], profile);

        // Sync survived the silent attempt; the scripted signature then
        // ended the session
        assert!(matches!(result, Err(Error::SignatureMismatch { .. })));
    }

    #[test]
    fn single_page_image_clips_terminal_byte() {
        let image = [0xAAu8; 100];
        assert_eq!(page_slice(&image, 0, 128, true).len(), 99);
        assert_eq!(page_slice(&image, 0, 128, false).len(), 100);

        // Multi-page images keep their full tail
        let image = [0xAAu8; 300];
        assert_eq!(page_slice(&image, 256, 128, true).len(), 44);
    }
}
