//! STK500 version 2 bootloader client
//!
//! Length-prefixed, sequence-numbered, XOR-checksummed messages as spoken
//! by the Mega bootloaders (ATmega1280/2560).

use std::{
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    cpu::{CpuProfile, IspTiming},
    error::{ConnectionError, Error},
    port::SerialPort,
    progress::LogSink,
};

const MESSAGE_START: u8 = 0x1B;
const TOKEN: u8 = 0x0E;

const CMD_SIGN_ON: u8 = 0x01;
const CMD_LOAD_ADDRESS: u8 = 0x06;
const CMD_ENTER_PROGMODE_ISP: u8 = 0x10;
const CMD_LEAVE_PROGMODE_ISP: u8 = 0x11;
const CMD_PROGRAM_FLASH_ISP: u8 = 0x13;
const CMD_READ_FLASH_ISP: u8 = 0x14;
const CMD_SPI_MULTI: u8 = 0x1D;

const STATUS_CMD_OK: u8 = 0x00;
const ANSWER_CKSUM_ERROR: u8 = 0xB0;

/// ISP read-program-memory opcode forwarded through `CMD_SPI_MULTI`
const AVR_OP_READ_SIGNATURE: u8 = 0x30;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
const SIGN_ON_ATTEMPTS: usize = 5;
/// Reset pulse delays
const RESET_DELAY_1: Duration = Duration::from_millis(10);
const RESET_DELAY_2: Duration = Duration::from_millis(1);
/// Largest message body we are prepared to buffer
const MAX_BODY: usize = 1024;

/// Session options beyond what the CPU profile carries
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Per-command receive timeout
    pub timeout: Duration,
    /// Withhold the terminal byte of images that fit in a single page
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

/// STK500v2 protocol engine
pub struct Stk500v2<'a> {
    port: &'a mut dyn SerialPort,
    log: &'a mut dyn LogSink,
    options: Options,
    sequence: u8,
}

/// Frame a message body: start byte, sequence number, big-endian length,
/// token, body, and the XOR of everything before it.
fn build_frame(sequence: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 6);
    frame.push(MESSAGE_START);
    frame.push(sequence);
    frame.push((body.len() >> 8) as u8);
    frame.push((body.len() & 0xFF) as u8);
    frame.push(TOKEN);
    frame.extend_from_slice(body);

    let checksum = frame.iter().fold(0u8, |acc, b| acc ^ b);
    frame.push(checksum);

    frame
}

impl<'a> Stk500v2<'a> {
    pub fn new(port: &'a mut dyn SerialPort, log: &'a mut dyn LogSink, options: Options) -> Self {
        Stk500v2 {
            port,
            log,
            options,
            sequence: 0,
        }
    }

    /// Program and verify `image`, leaving programming mode on both success
    /// and failure paths.
    pub fn bootload(&mut self, image: &[u8], profile: &CpuProfile) -> Result<(), Error> {
        let timing = profile.timing.unwrap_or(IspTiming {
            timeout: 0xC8,
            stab_delay: 0x64,
            cmdexe_delay: 0x19,
            synch_loops: 0x20,
            byte_delay: 0x00,
            poll_value: 0x53,
            poll_index: 0x03,
        });

        self.reset_target()?;
        self.sign_on(SIGN_ON_ATTEMPTS)?;
        self.verify_signature(profile.signature)?;
        self.enter_progmode(&timing)?;

        let mut result = self.upload(image, profile.page_size);
        if result.is_ok() {
            result = self.verify(image, profile.page_size);
        }

        let left = self.leave_progmode();

        result.and(left)
    }

    /// Pulse DTR/RTS to reset the target into its bootloader
    fn reset_target(&mut self) -> Result<(), Error> {
        debug!("Resetting target via DTR/RTS");

        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(false)?;

        sleep(RESET_DELAY_1);

        self.port.write_data_terminal_ready(true)?;
        self.port.write_request_to_send(true)?;

        sleep(RESET_DELAY_2);

        Ok(())
    }

    fn sign_on(&mut self, attempts: usize) -> Result<(), Error> {
        match self.command(&[CMD_SIGN_ON]) {
            Ok(reply) => {
                // Body: command, status, identifier length, identifier
                let id = reply
                    .get(3..)
                    .zip(reply.get(2))
                    .and_then(|(id, &len)| id.get(..len as usize))
                    .map(|id| String::from_utf8_lossy(id).into_owned())
                    .unwrap_or_default();

                debug!("Programmer identifier: {id:?}");
                self.log.write_line(&format!("Connected to {id}"));

                Ok(())
            }
            Err(e) if e.is_timeout() && attempts > 1 => {
                debug!("No sign-on reply, retrying ({} attempts left)", attempts - 1);
                self.sign_on(attempts - 1)
            }
            Err(e) => Err(e),
        }
    }

    fn verify_signature(&mut self, expected: &[u8]) -> Result<(), Error> {
        let mut found = Vec::with_capacity(3);

        for offset in 0..3u8 {
            let reply = self.command(&[
                CMD_SPI_MULTI,
                4, // bytes to transmit
                4, // bytes to receive
                0, // receive offset
                AVR_OP_READ_SIGNATURE,
                0x00,
                offset,
                0x00,
            ])?;

            // The byte clocked out on the final transfer is the signature
            let byte = *reply.get(5).ok_or_else(|| {
                ConnectionError::ProtocolMismatch("short SPI_MULTI reply".into())
            })?;
            found.push(byte);
        }

        if found != expected {
            return Err(Error::SignatureMismatch {
                expected: expected.to_vec(),
                found,
            });
        }

        debug!("Device signature OK: {found:02x?}");

        Ok(())
    }

    fn enter_progmode(&mut self, timing: &IspTiming) -> Result<(), Error> {
        self.command(&[
            CMD_ENTER_PROGMODE_ISP,
            timing.timeout,
            timing.stab_delay,
            timing.cmdexe_delay,
            timing.synch_loops,
            timing.byte_delay,
            timing.poll_value,
            timing.poll_index,
            0xAC,
            0x53,
            0x00,
            0x00,
        ])?;

        Ok(())
    }

    fn leave_progmode(&mut self) -> Result<(), Error> {
        self.command(&[CMD_LEAVE_PROGMODE_ISP, 0x01, 0x01])?;

        Ok(())
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

            let mut body = vec![
                CMD_PROGRAM_FLASH_ISP,
                (page.len() >> 8) as u8,
                (page.len() & 0xFF) as u8,
                0xC1, // paged write with polling
                0x0A, // delay
                0x40, // Load Page Low command
                0x4C, // Write Page command
                0x20, // Read Program Memory command
                0x00, // poll value 1
                0x00, // poll value 2
            ];
            body.extend_from_slice(page);

            self.command(&body)?;

            page_addr += page_size;
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

            let reply = self.command(&[
                CMD_READ_FLASH_ISP,
                (page.len() >> 8) as u8,
                (page.len() & 0xFF) as u8,
                0x20, // Read Program Memory command
            ])?;

            if reply.len() < page.len() + 3
                || &reply[2..2 + page.len()] != page
                || reply[2 + page.len()] != STATUS_CMD_OK
            {
                return Err(Error::VerifyFailed {
                    address: page_addr as u32,
                });
            }

            page_addr += page_size;
        }

        self.log.write_line("Flash verified");

        Ok(())
    }

    /// Load the 32-bit word address; the top bit keeps the extended-address
    /// path active on parts with more than 128 KiB of flash.
    fn load_address(&mut self, byte_addr: usize) -> Result<(), Error> {
        let word_addr = (byte_addr >> 1) as u32 | 0x8000_0000;

        self.command(&[
            CMD_LOAD_ADDRESS,
            (word_addr >> 24) as u8,
            (word_addr >> 16) as u8,
            (word_addr >> 8) as u8,
            (word_addr & 0xFF) as u8,
        ])?;

        Ok(())
    }

    /// Send one message and receive its reply body
    fn command(&mut self, body: &[u8]) -> Result<Vec<u8>, Error> {
        let sequence = self.sequence;

        self.port.write_all(&build_frame(sequence, body))?;

        let (reply_sequence, reply) = self.recv()?;
        self.sequence = self.sequence.wrapping_add(1);

        if reply_sequence != sequence {
            return Err(ConnectionError::ProtocolMismatch(format!(
                "reply sequence {reply_sequence} does not match request {sequence}"
            ))
            .into());
        }

        if reply.first() == Some(&ANSWER_CKSUM_ERROR) {
            return Err(ConnectionError::PeerChecksumError.into());
        }

        if reply.first() != body.first() {
            return Err(ConnectionError::ProtocolMismatch(format!(
                "reply echoes command {:02x?}, expected {:02x?}",
                reply.first(),
                body.first()
            ))
            .into());
        }

        if reply.get(1) != Some(&STATUS_CMD_OK) {
            return Err(ConnectionError::ProtocolMismatch(format!(
                "command status {:02x?}",
                reply.get(1)
            ))
            .into());
        }

        Ok(reply)
    }

    /// Receive one frame through the message state machine
    fn recv(&mut self) -> Result<(u8, Vec<u8>), Error> {
        enum RxState {
            Start,
            SeqNum,
            Size1,
            Size2,
            Token,
            Data,
            Checksum,
        }

        let deadline = Instant::now() + self.options.timeout;

        let mut state = RxState::Start;
        let mut xor = 0u8;
        let mut sequence = 0u8;
        let mut size = 0usize;
        let mut body: Vec<u8> = Vec::new();

        loop {
            let mut byte = [0u8; 1];
            self.read_some(&mut byte, deadline)?;
            let byte = byte[0];

            match state {
                RxState::Start => {
                    if byte == MESSAGE_START {
                        xor = byte;
                        state = RxState::SeqNum;
                    }
                    // Noise ahead of the start byte is discarded
                }
                RxState::SeqNum => {
                    sequence = byte;
                    xor ^= byte;
                    state = RxState::Size1;
                }
                RxState::Size1 => {
                    size = (byte as usize) << 8;
                    xor ^= byte;
                    state = RxState::Size2;
                }
                RxState::Size2 => {
                    size |= byte as usize;
                    xor ^= byte;

                    if size > MAX_BODY {
                        return Err(ConnectionError::FramingOverflow.into());
                    }

                    state = RxState::Token;
                }
                RxState::Token => {
                    if byte != TOKEN {
                        return Err(ConnectionError::ProtocolMismatch(format!(
                            "bad message token {byte:#04x}"
                        ))
                        .into());
                    }
                    xor ^= byte;
                    body = Vec::with_capacity(size);
                    state = if size == 0 {
                        RxState::Checksum
                    } else {
                        RxState::Data
                    };
                }
                RxState::Data => {
                    body.push(byte);
                    xor ^= byte;
                    if body.len() == size {
                        state = RxState::Checksum;
                    }
                }
                RxState::Checksum => {
                    xor ^= byte;
                    if xor != 0 {
                        return Err(ConnectionError::ProtocolMismatch(
                            "message checksum mismatch".into(),
                        )
                        .into());
                    }

                    return Ok((sequence, body));
                }
            }
        }
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

/// Slice one page out of the image, withholding the terminal byte of
/// single-page images when `tail_clip` is set.
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
