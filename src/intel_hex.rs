//! Intel HEX images
//!
//! Converts between `.hex` files and the flat images split by
//! [`image::pages`](crate::image::pages).

use ihex::{Reader, ReaderError, Record, WriterError};

use crate::image::ERASED;

/// Data bytes per record when encoding
pub const RECORD_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("invalid hex record: {0}")]
    Parse(ReaderError),

    #[error("could not encode hex records: {0}")]
    Write(WriterError),

    #[error("data at 0x{address:05x} extends past 0x{limit:05x}")]
    TooLarge { address: u32, limit: u32 },
}

/// Flatten hex records into an image starting at address 0.
///
/// Bytes not covered by a data record are left erased. Data ending past
/// `limit` is rejected.
pub fn parse(text: &str, limit: u32) -> Result<Vec<u8>, HexError> {
    let mut image = Vec::new();
    let mut base = 0u32;

    for record in Reader::new(text) {
        match record.map_err(HexError::Parse)? {
            Record::Data { offset, value } => {
                let start = base as u64 + offset as u64;
                let end = start + value.len() as u64;
                if end > limit as u64 {
                    return Err(HexError::TooLarge {
                        address: start as u32,
                        limit,
                    });
                }

                let (start, end) = (start as usize, end as usize);
                if image.len() < end {
                    image.resize(end, ERASED);
                }
                image[start..end].copy_from_slice(&value);
            }
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::EndOfFile => break,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => (),
        }
    }

    debug!("Parsed {} byte image", image.len());

    Ok(image)
}

/// Encode `data` read from `address` as hex records
pub fn encode(data: &[u8], address: u32) -> Result<String, HexError> {
    let mut records = Vec::with_capacity(data.len() / RECORD_LEN + 2);
    let mut upper = 0u16;

    for (i, chunk) in data.chunks(RECORD_LEN).enumerate() {
        let a = address + (i * RECORD_LEN) as u32;

        let hi = (a >> 16) as u16;
        if hi != upper {
            records.push(Record::ExtendedLinearAddress(hi));
            upper = hi;
        }

        records.push(Record::Data {
            offset: a as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records).map_err(HexError::Write)
}
