//! Firmware image ingestion
//!
//! AVR tools consume one contiguous flash image starting at address 0,
//! normally parsed from Intel-HEX text. The ESP loader consumes a list of
//! pre-addressed binary segments instead.

use ihex::Record;

use crate::error::Error;

/// A chunk of firmware at an absolute flash address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn new(addr: u32, data: Vec<u8>) -> Self {
        Segment { addr, data }
    }
}

/// A parsed firmware image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Contiguous bytes from address 0 up to the highest address seen,
    /// gaps filled with `0xFF` (erased-flash value)
    pub data: Vec<u8>,
    /// Entry point from a Start Linear Address record, if present
    pub start_linear_address: Option<u32>,
    /// Entry point from a Start Segment Address record, if present
    pub start_segment_address: Option<u32>,
    /// Pre-addressed segments (ESP uploads)
    pub segments: Vec<Segment>,
}

impl FirmwareImage {
    /// Parse Intel-HEX text into a contiguous image
    pub fn from_ihex(source: &str) -> Result<Self, Error> {
        let mut data: Vec<u8> = Vec::new();
        let mut base: u32 = 0;
        let mut start_linear_address = None;
        let mut start_segment_address = None;

        for record in ihex::Reader::new(source) {
            let record = record.map_err(|e| Error::InvalidImage(e.to_string()))?;

            match record {
                Record::Data { offset, value } => {
                    let addr = (base + offset as u32) as usize;
                    let end = addr + value.len();
                    if end > data.len() {
                        data.resize(end, 0xFF);
                    }
                    data[addr..end].copy_from_slice(&value);
                }
                Record::ExtendedLinearAddress(upper) => {
                    base = (upper as u32) << 16;
                }
                Record::ExtendedSegmentAddress(segment) => {
                    base = (segment as u32) << 4;
                }
                Record::StartLinearAddress(addr) => {
                    start_linear_address = Some(addr);
                }
                Record::StartSegmentAddress { cs, ip } => {
                    start_segment_address = Some(((cs as u32) << 4) + ip as u32);
                }
                Record::EndOfFile => break,
            }
        }

        if data.is_empty() {
            return Err(Error::InvalidImage("no data records".into()));
        }

        Ok(FirmwareImage {
            data,
            start_linear_address,
            start_segment_address,
            segments: Vec::new(),
        })
    }

    /// Build an image from pre-addressed segments. The first segment doubles
    /// as the contiguous image for tools that expect one.
    pub fn from_segments(segments: Vec<Segment>) -> Result<Self, Error> {
        let data = segments
            .first()
            .map(|s| s.data.clone())
            .ok_or(Error::MissingImage)?;

        Ok(FirmwareImage {
            data,
            start_linear_address: None,
            start_segment_address: None,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    // Two data records with a gap, then EOF
    const BLINK: &str = ":100000000C945C000C946E000C946E000C946E00CA\n\
                        :100020000C946E000C946E000C946E000C946E0098\n\
                        :00000001FF\n";

    #[test]
    fn parses_data_records_with_gap_fill() {
        let image = FirmwareImage::from_ihex(BLINK).unwrap();

        assert_eq!(image.data.len(), 0x30);
        assert_eq!(&image.data[0..4], &[0x0C, 0x94, 0x5C, 0x00]);
        // Gap between the records reads as erased flash
        assert_eq!(&image.data[0x10..0x20], &[0xFF; 16]);
        assert_eq!(&image.data[0x20..0x24], &[0x0C, 0x94, 0x6E, 0x00]);
    }

    #[test]
    fn extended_linear_address_offsets_data() {
        let hex = ":020000040001F9\n:0400000001020304F2\n:00000001FF\n";
        let image = FirmwareImage::from_ihex(hex).unwrap();

        assert_eq!(image.data.len(), 0x10004);
        assert_eq!(&image.data[0x10000..], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(image.data[0], 0xFF);
    }

    #[test]
    fn records_start_linear_address() {
        let hex = ":0400000501000000F6\n:0400000001020304F2\n:00000001FF\n";
        let image = FirmwareImage::from_ihex(hex).unwrap();

        assert_eq!(image.start_linear_address, Some(0x0100_0000));
    }

    #[test]
    fn rejects_garbage() {
        assert!(FirmwareImage::from_ihex("not a hex file").is_err());
    }

    #[test]
    fn empty_segment_list_is_missing_image() {
        assert!(matches!(
            FirmwareImage::from_segments(vec![]),
            Err(Error::MissingImage)
        ));
    }

    #[test]
    fn first_segment_backs_the_contiguous_image() {
        let image = FirmwareImage::from_segments(vec![
            Segment::new(0x1000, vec![1, 2, 3]),
            Segment::new(0x8000, vec![4]),
        ])
        .unwrap();

        assert_eq!(image.data, vec![1, 2, 3]);
        assert_eq!(image.segments.len(), 2);
    }
}
