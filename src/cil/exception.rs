//! Exception handler regions and their binary section format
//!
//! A method body may be followed by one or more "extra data sections", in practice always the
//! exception handler table. The table has two shapes: a small one with byte-sized lengths and a
//! fat one with 4-byte fields throughout (ECMA-335 §II.25.4.5-6). The writer picks the smallest
//! shape that fits; the reader detects the shape from a flag bit in the section header.

use super::binary_format::{Deserialize, Serialize};
use super::errors::Error;
use super::instruction::Label;
use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

bitflags! {
    /// Flags in the first byte of an extra data section
    pub struct SectionFlags: u8 {
        /// The section is an exception handler table
        const EH_TABLE = 0x01;
        /// Entries use the fat (4-byte field) layout
        const FAT_FORMAT = 0x40;
        /// Another section follows this one
        const MORE_SECTS = 0x80;
    }
}

/// What a handler does when control reaches it
#[derive(Clone, Debug, PartialEq)]
pub enum HandlerKind<R> {
    /// Runs when the thrown exception is assignable to the given type
    Catch(R),

    /// Runs the filter code first (from `filter_start` up to the handler) to decide
    Filter { filter_start: Label },

    /// Always runs on the way out of the protected region
    Finally,

    /// Runs only when the protected region is left by an exception
    Fault,
}

impl<R> HandlerKind<R> {
    pub(crate) fn flags(&self) -> u32 {
        match self {
            HandlerKind::Catch(_) => 0x0000,
            HandlerKind::Filter { .. } => 0x0001,
            HandlerKind::Finally => 0x0002,
            HandlerKind::Fault => 0x0004,
        }
    }
}

/// One protected region and its handler, in label form
///
/// `try_end` and `handler_end` resolve to "one past" their region: a label marked at the
/// end-of-stream position covers a region running to the method's end.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionHandler<R> {
    pub kind: HandlerKind<R>,
    pub try_start: Label,
    pub try_end: Label,
    pub handler_start: Label,
    pub handler_end: Label,
}

impl<R> ExceptionHandler<R> {
    /// Map the catch-type reference representation
    pub fn map_refs<R2, E>(
        &self,
        map_ref: impl Fn(&R) -> Result<R2, E>,
    ) -> Result<ExceptionHandler<R2>, E> {
        Ok(ExceptionHandler {
            kind: match &self.kind {
                HandlerKind::Catch(r) => HandlerKind::Catch(map_ref(r)?),
                HandlerKind::Filter { filter_start } => HandlerKind::Filter {
                    filter_start: *filter_start,
                },
                HandlerKind::Finally => HandlerKind::Finally,
                HandlerKind::Fault => HandlerKind::Fault,
            },
            try_start: self.try_start,
            try_end: self.try_end,
            handler_start: self.handler_start,
            handler_end: self.handler_end,
        })
    }

    /// All labels this handler pins to stream positions
    pub fn labels(&self) -> Vec<Label> {
        let mut labels = vec![
            self.try_start,
            self.try_end,
            self.handler_start,
            self.handler_end,
        ];
        if let HandlerKind::Filter { filter_start } = self.kind {
            labels.push(filter_start);
        }
        labels
    }
}

/// One handler entry with every position resolved to byte offsets
///
/// The `trailing` field is kind-specific: a type token for catch, the filter start offset for
/// filter, zero for finally and fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct RawHandler {
    pub flags: u32,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    pub trailing: u32,
}

impl RawHandler {
    /// Does this entry fit the small layout's field widths?
    fn fits_small(&self) -> bool {
        self.try_offset <= u16::MAX as u32
            && self.handler_offset <= u16::MAX as u32
            && self.try_length <= u8::MAX as u32
            && self.handler_length <= u8::MAX as u32
    }
}

/// Small sections hold at most 20 entries: the 1-byte data size field must cover the 4-byte
/// header plus 12 bytes per entry.
const MAX_SMALL_HANDLERS: usize = 20;

const SMALL_ENTRY_SIZE: usize = 12;
const FAT_ENTRY_SIZE: usize = 24;

/// Write the exception handler table as one section, choosing the smallest shape that fits
pub(crate) fn write_section<W: WriteBytesExt>(
    handlers: &[RawHandler],
    writer: &mut W,
) -> Result<(), Error> {
    let small = handlers.len() <= MAX_SMALL_HANDLERS
        && handlers.iter().all(RawHandler::fits_small);

    if small {
        let flags = SectionFlags::EH_TABLE;
        let data_size = 4 + SMALL_ENTRY_SIZE * handlers.len();
        flags.bits().serialize(writer)?;
        (data_size as u8).serialize(writer)?;
        0u16.serialize(writer)?;
        for handler in handlers {
            (handler.flags as u16).serialize(writer)?;
            (handler.try_offset as u16).serialize(writer)?;
            (handler.try_length as u8).serialize(writer)?;
            (handler.handler_offset as u16).serialize(writer)?;
            (handler.handler_length as u8).serialize(writer)?;
            handler.trailing.serialize(writer)?;
        }
    } else {
        let flags = SectionFlags::EH_TABLE | SectionFlags::FAT_FORMAT;
        let data_size = 4 + FAT_ENTRY_SIZE * handlers.len();
        flags.bits().serialize(writer)?;
        // 3-byte data size, little-endian
        (data_size as u8).serialize(writer)?;
        ((data_size >> 8) as u8).serialize(writer)?;
        ((data_size >> 16) as u8).serialize(writer)?;
        for handler in handlers {
            handler.flags.serialize(writer)?;
            handler.try_offset.serialize(writer)?;
            handler.try_length.serialize(writer)?;
            handler.handler_offset.serialize(writer)?;
            handler.handler_length.serialize(writer)?;
            handler.trailing.serialize(writer)?;
        }
    }
    Ok(())
}

/// Read one extra data section; returns the handlers plus whether another section follows
pub(crate) fn read_section(
    cursor: &mut Cursor<&[u8]>,
) -> Result<(Vec<RawHandler>, bool), Error> {
    let section_offset = cursor.position() as usize;
    let malformed = |message: String| Error::MalformedEncoding {
        offset: section_offset,
        message,
    };

    let flag_byte = cursor
        .read_u8()
        .map_err(|_| malformed("truncated section header".to_string()))?;
    let flags = SectionFlags::from_bits(flag_byte)
        .ok_or_else(|| malformed(format!("unknown section flags {:#04x}", flag_byte)))?;
    if !flags.contains(SectionFlags::EH_TABLE) {
        return Err(malformed(format!(
            "unsupported section kind {:#04x}",
            flag_byte
        )));
    }
    let more = flags.contains(SectionFlags::MORE_SECTS);
    let fat = flags.contains(SectionFlags::FAT_FORMAT);

    let mut handlers = vec![];
    if fat {
        let b1 = cursor.read_u8().map_err(|_| malformed("truncated data size".to_string()))?;
        let b2 = cursor.read_u8().map_err(|_| malformed("truncated data size".to_string()))?;
        let b3 = cursor.read_u8().map_err(|_| malformed("truncated data size".to_string()))?;
        let data_size = b1 as usize | (b2 as usize) << 8 | (b3 as usize) << 16;
        if data_size < 4 || (data_size - 4) % FAT_ENTRY_SIZE != 0 {
            return Err(malformed(format!("bad fat section size {}", data_size)));
        }
        let count = (data_size - 4) / FAT_ENTRY_SIZE;
        for _ in 0..count {
            let read_err = |_| malformed("truncated fat handler entry".to_string());
            handlers.push(RawHandler {
                flags: u32::deserialize(cursor).map_err(read_err)?,
                try_offset: u32::deserialize(cursor).map_err(read_err)?,
                try_length: u32::deserialize(cursor).map_err(read_err)?,
                handler_offset: u32::deserialize(cursor).map_err(read_err)?,
                handler_length: u32::deserialize(cursor).map_err(read_err)?,
                trailing: u32::deserialize(cursor).map_err(read_err)?,
            });
        }
    } else {
        let data_size = cursor
            .read_u8()
            .map_err(|_| malformed("truncated data size".to_string()))? as usize;
        let _reserved = u16::deserialize(cursor)
            .map_err(|_| malformed("truncated section header".to_string()))?;
        if data_size < 4 || (data_size - 4) % SMALL_ENTRY_SIZE != 0 {
            return Err(malformed(format!("bad small section size {}", data_size)));
        }
        let count = (data_size - 4) / SMALL_ENTRY_SIZE;
        for _ in 0..count {
            let read_err = |_| malformed("truncated small handler entry".to_string());
            handlers.push(RawHandler {
                flags: u16::deserialize(cursor).map_err(read_err)? as u32,
                try_offset: u16::deserialize(cursor).map_err(read_err)? as u32,
                try_length: u8::deserialize(cursor).map_err(read_err)? as u32,
                handler_offset: u16::deserialize(cursor).map_err(read_err)? as u32,
                handler_length: u8::deserialize(cursor).map_err(read_err)? as u32,
                trailing: u32::deserialize(cursor).map_err(read_err)?,
            });
        }
    }

    Ok((handlers, more))
}

#[cfg(test)]
mod test {
    use super::*;

    fn catch_entry(try_offset: u32, try_length: u32) -> RawHandler {
        RawHandler {
            flags: 0,
            try_offset,
            try_length,
            handler_offset: try_offset + try_length,
            handler_length: 3,
            trailing: 0x0100_0001,
        }
    }

    #[test]
    fn small_table_round_trips() {
        let handlers = vec![catch_entry(0, 10), catch_entry(20, 200)];
        let mut bytes = vec![];
        write_section(&handlers, &mut bytes).unwrap();

        // Small layout: flag byte, 1-byte size, 2 reserved bytes, 12 bytes per entry
        assert_eq!(bytes[0], SectionFlags::EH_TABLE.bits());
        assert_eq!(bytes.len(), 4 + 12 * handlers.len());

        let mut cursor = Cursor::new(bytes.as_slice());
        let (decoded, more) = read_section(&mut cursor).unwrap();
        assert!(!more);
        assert_eq!(decoded, handlers);
    }

    #[test]
    fn oversized_region_forces_fat_table() {
        let handlers = vec![catch_entry(0, 300)];
        let mut bytes = vec![];
        write_section(&handlers, &mut bytes).unwrap();

        assert_eq!(
            bytes[0],
            (SectionFlags::EH_TABLE | SectionFlags::FAT_FORMAT).bits()
        );
        assert_eq!(bytes.len(), 4 + 24);

        let mut cursor = Cursor::new(bytes.as_slice());
        let (decoded, more) = read_section(&mut cursor).unwrap();
        assert!(!more);
        assert_eq!(decoded, handlers);
    }

    #[test]
    fn handler_count_forces_fat_table() {
        let handlers: Vec<RawHandler> = (0..21).map(|i| catch_entry(i * 10, 5)).collect();
        let mut bytes = vec![];
        write_section(&handlers, &mut bytes).unwrap();
        assert_eq!(
            bytes[0],
            (SectionFlags::EH_TABLE | SectionFlags::FAT_FORMAT).bits()
        );

        let mut cursor = Cursor::new(bytes.as_slice());
        let (decoded, _) = read_section(&mut cursor).unwrap();
        assert_eq!(decoded, handlers);
    }

    #[test]
    fn unknown_section_kind_is_rejected() {
        let bytes = vec![0x02u8, 0x04, 0x00, 0x00];
        let mut cursor = Cursor::new(bytes.as_slice());
        assert!(matches!(
            read_section(&mut cursor),
            Err(Error::MalformedEncoding { .. })
        ));
    }
}
