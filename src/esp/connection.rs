//! Command transport for the Espressif serial loader
//!
//! [`Connection`] owns the port for the duration of the session and handles
//! SLIP framing, request/response pairing, and decoding of the loader's
//! status trailer.

use std::time::Duration;

use log::debug;
use slip_codec::SlipDecoder;

use super::{
    command::{Command, CommandType},
    slip,
};
use crate::{
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    port::{PortReader, SerialPort},
};

/// Register that reads as a chip-identifying magic value on every supported
/// part
pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// Stale replies tolerated before a command is declared unanswered
const MAX_STALE_REPLIES: usize = 100;

/// The useful part of a reply, interpreted from its payload length
#[derive(Debug, Clone)]
pub enum ResponseValue {
    /// The 32-bit value word every reply carries (`READ_REG` results land
    /// here)
    Word(u32),
    /// An MD5 digest, whichever encoding the loader used on the wire
    Digest(u128),
    /// Anything else the loader attached
    Payload(Vec<u8>),
}

impl TryFrom<ResponseValue> for u32 {
    type Error = Error;

    fn try_from(value: ResponseValue) -> Result<Self, Error> {
        match value {
            ResponseValue::Word(word) => Ok(word),
            other => Err(Error::InvalidResponse(format!(
                "expected a register word, got {other:?}"
            ))),
        }
    }
}

impl TryFrom<ResponseValue> for u128 {
    type Error = Error;

    fn try_from(value: ResponseValue) -> Result<Self, Error> {
        match value {
            ResponseValue::Digest(digest) => Ok(digest),
            other => Err(Error::InvalidResponse(format!(
                "expected an MD5 digest, got {other:?}"
            ))),
        }
    }
}

impl TryFrom<ResponseValue> for Vec<u8> {
    type Error = Error;

    fn try_from(value: ResponseValue) -> Result<Self, Error> {
        match value {
            ResponseValue::Payload(payload) => Ok(payload),
            other => Err(Error::InvalidResponse(format!(
                "expected a payload, got {other:?}"
            ))),
        }
    }
}

/// A decoded reply from the loader
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Opcode the reply echoes
    pub return_op: u8,
    pub value: ResponseValue,
    /// Pass/fail byte from the status trailer (zero is success)
    pub status: u8,
    /// ROM error code, meaningful when `status` is non-zero
    pub error: u8,
}

/// An established connection with a target device
pub struct Connection {
    port: Box<dyn SerialPort>,
    decoder: SlipDecoder,
}

impl Connection {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Connection {
            port,
            decoder: SlipDecoder::new(),
        }
    }

    /// Try one sync round: send `SYNC` and wait for any matching ack, then
    /// drain the duplicate acks the loader sends back.
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |connection| {
            connection.command(Command::Sync)?;
            Ok(())
        })?;

        // The loader acknowledges SYNC several times over; swallow the rest
        // so they do not confuse the next command.
        let _ = self.with_timeout(CommandType::Sync.timeout(), |connection| {
            while connection.read_response()?.is_some() {}
            Ok(())
        });
        self.port.clear_input()?;

        Ok(())
    }

    /// Read the chip-detect magic word
    pub(crate) fn detect_magic(&mut self) -> Result<u32, Error> {
        self.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)
    }

    /// Set the read/write timeout of the serial port
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    /// Set baud rate for the serial port
    pub fn set_baud(&mut self, speed: u32) -> Result<(), Error> {
        self.port.set_baud_rate(speed)?;

        Ok(())
    }

    /// Get the current baud rate of the serial port
    pub fn baud(&self) -> u32 {
        self.port.baud_rate()
    }

    /// Run a command with a timeout defined by the command type
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout)?;

        let result = f(self);

        self.port.set_timeout(old_timeout)?;

        result
    }

    /// Send a command and wait for the reply that echoes its opcode
    pub fn command(&mut self, command: Command<'_>) -> Result<ResponseValue, Error> {
        let ty = command.command_type();
        debug!("Sending command: {command:x?}");

        let frame = slip::encode(&command.encode());
        self.port.clear_input()?;
        self.port.write_all(&frame)?;
        self.port.flush()?;

        // Acks for earlier commands may still be in flight; skip whatever
        // does not echo our opcode.
        let mut stale = 0;
        loop {
            let response = match self.read_response().for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => response,
                _ => {
                    stale += 1;
                    if stale > MAX_STALE_REPLIES {
                        return Err(ConnectionError::ProtocolMismatch(format!(
                            "no reply to {ty}"
                        ))
                        .into());
                    }
                    continue;
                }
            };

            if response.status != 0 {
                return Err(RomError::new(ty, RomErrorKind::from(response.error)).into());
            }

            return Ok(response.value);
        }
    }

    /// Read and decode one reply, or `None` when the frame is too short to
    /// be one.
    pub fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        let packet = self.read_packet()?;

        // Response header: direction, opcode, body length, value word
        if packet.len() < 10 {
            return Ok(None);
        }
        let return_op = packet[1];
        let value_word = u32::from_le_bytes(packet[4..8].try_into().unwrap());
        let body = &packet[8..];

        // The stub loader closes every reply with two status bytes, the ROM
        // loaders with four. Reply sizes are fixed per flavor, so the body
        // length tells the two apart: stub bodies are 2 bytes for plain
        // commands and 18 for MD5.
        let trailer = if body.len() == 2 || body.len() == 18 {
            2
        } else {
            4
        };
        if body.len() < trailer {
            return Ok(None);
        }
        let (payload, status) = body.split_at(body.len() - trailer);

        let value = match payload.len() {
            0 => ResponseValue::Word(value_word),
            // The stub returns MD5 digests as raw bytes
            16 => ResponseValue::Digest(u128::from_be_bytes(payload.try_into().unwrap())),
            // The ROM loaders return them as ASCII hex
            32 => {
                let text = std::str::from_utf8(payload)
                    .map_err(|_| Error::InvalidResponse("MD5 digest is not ASCII hex".into()))?;
                let digest = u128::from_str_radix(text, 16)
                    .map_err(|_| Error::InvalidResponse("MD5 digest is not ASCII hex".into()))?;
                ResponseValue::Digest(digest)
            }
            _ => ResponseValue::Payload(payload.to_vec()),
        };

        Ok(Some(CommandResponse {
            return_op,
            value,
            status: status[0],
            error: status[1],
        }))
    }

    /// Read a 32-bit register
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |connection| {
            connection.command(Command::ReadReg { address })
        })?
        .try_into()
    }

    /// Write a 32-bit register, optionally under a mask
    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |connection| {
            connection.command(Command::WriteReg {
                address,
                value,
                mask,
            })
        })
        .map(|_| ())
    }

    /// Decode a single SLIP frame from the port
    pub(crate) fn read_packet(&mut self) -> Result<Vec<u8>, Error> {
        let mut response = Vec::new();
        self.decoder
            .decode(&mut PortReader(self.port.as_mut()), &mut response)
            .map_err(ConnectionError::from)?;

        Ok(response)
    }

    /// Read bytes from the port without protocol interpretation, draining
    /// whatever arrives until the timeout expires. Used to consume the ROM
    /// boot banner after a reset.
    pub(crate) fn drain(&mut self) -> Result<Vec<u8>, Error> {
        let mut banner = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => banner.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(ConnectionError::IoRead(e).into()),
            }
        }

        Ok(banner)
    }

    /// Flush the serial port
    pub fn flush(&mut self) -> Result<(), Error> {
        self.port.flush()?;
        Ok(())
    }

    /// Borrow the underlying port
    pub fn port_mut(&mut self) -> &mut dyn SerialPort {
        self.port.as_mut()
    }

    /// Give the port back to the caller
    pub fn into_port(self) -> Box<dyn SerialPort> {
        self.port
    }
}
