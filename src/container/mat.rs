//! MATLAB level 5 MAT-file holding a single 1 x N numeric row vector.
//!
//! Layout (offsets in bytes):
//! ```text
//!   0  descriptive text (116) + subsystem offset (8)
//! 124  version 0x0100
//! 126  endian indicator "IM" / "MI"
//! 128  miMATRIX tag             132 matrix byte count   <- patched
//! 136  array flags tag          144 class, 148 reserved
//! 152  dimensions tag           160 rows = 1, 164 cols  <- patched
//! 168  array name (small data element, <= 4 bytes)
//! 176  data tag                 180 data byte count     <- patched
//! 184  raw elements, zero padded to 8 bytes on finalize
//! ```

use std::io::{Read, Seek, SeekFrom, Write};

use super::{ByteOrder, Dtype};
use crate::{Error, Result};

pub const PREAMBLE_LEN: u64 = 128;
pub const MATRIX_SIZE_OFFSET: u64 = 132;
pub const COLUMNS_OFFSET: u64 = 164;
pub const DATA_SIZE_OFFSET: u64 = 180;
pub const DATA_OFFSET: u64 = 184;
pub const ARRAY_NAME: &[u8] = b"data";

const TEXT_LEN: usize = 116;
const VERSION: u16 = 0x0100;
const MI_INT8: u32 = 1;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_MATRIX: u32 = 14;

impl Dtype {
    fn mat_class(self) -> u32 {
        match self {
            Dtype::F64 => 6,
            Dtype::I16 => 10,
        }
    }

    fn mat_data_type(self) -> u32 {
        match self {
            Dtype::F64 => 9,
            Dtype::I16 => 3,
        }
    }

    fn from_mat_class(class: u32) -> Result<Self> {
        match class {
            6 => Ok(Dtype::F64),
            10 => Ok(Dtype::I16),
            c => Err(Error::Container(format!("unsupported MAT class {c}"))),
        }
    }
}

fn descriptive_text() -> [u8; TEXT_LEN] {
    let text = format!(
        "MATLAB 5.0 MAT-file, Platform: {}, Created on: {}",
        std::env::consts::OS,
        chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
    );
    let mut out = [b' '; TEXT_LEN];
    let n = text.len().min(TEXT_LEN);
    out[..n].copy_from_slice(&text.as_bytes()[..n]);
    out
}

/// Write everything up to the first data byte, with zero placeholders for the sizes
pub fn write_header<W: Write>(w: &mut W, dtype: Dtype) -> std::io::Result<()> {
    w.write_all(&descriptive_text())?;
    w.write_all(&[0u8; 8])?;
    w.write_all(&VERSION.to_ne_bytes())?;
    w.write_all(&((u16::from(b'M') << 8) | u16::from(b'I')).to_ne_bytes())?;

    let mut words = vec![
        MI_MATRIX,
        0,
        MI_UINT32,
        8,
        dtype.mat_class(),
        0,
        MI_INT32,
        8,
        1,
        0,
        ((ARRAY_NAME.len() as u32) << 16) | MI_INT8,
    ];
    let mut name = [0u8; 4];
    name[..ARRAY_NAME.len()].copy_from_slice(ARRAY_NAME);
    words.push(u32::from_ne_bytes(name));
    words.extend([dtype.mat_data_type(), 0]);
    for word in words {
        w.write_all(&word.to_ne_bytes())?;
    }
    Ok(())
}

fn write_u32_at<W: Write + Seek>(w: &mut W, offset: u64, value: u32) -> std::io::Result<()> {
    w.seek(SeekFrom::Start(offset))?;
    w.write_all(&value.to_ne_bytes())
}

/// Pad the data to an 8 byte boundary and back-fill the three size fields.
/// `w` must be positioned at the end of the data.
pub fn patch<W: Write + Seek>(w: &mut W, dtype: Dtype) -> Result<()> {
    let end = w.stream_position()?;
    let data_bytes = end - DATA_SIZE_OFFSET - 4;
    let pad = (8 - data_bytes % 8) % 8;
    w.write_all(&vec![0u8; pad as usize])?;
    let matrix_bytes = end + pad - (MATRIX_SIZE_OFFSET + 4);
    if matrix_bytes > u32::MAX as u64 || data_bytes / dtype.size() as u64 > i32::MAX as u64 {
        return Err(Error::Container(format!(
            "{data_bytes} data bytes do not fit in a level 5 MAT-file"
        )));
    }
    write_u32_at(w, MATRIX_SIZE_OFFSET, matrix_bytes as u32)?;
    write_u32_at(w, COLUMNS_OFFSET, (data_bytes / dtype.size() as u64) as u32)?;
    write_u32_at(w, DATA_SIZE_OFFSET, data_bytes as u32)?;
    w.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Where the elements live in a MAT-file and how to decode them
pub struct Layout {
    pub dtype: Dtype,
    pub order: ByteOrder,
    pub data_offset: u64,
    pub data_bytes: u64,
}

struct TagReader<'a, R> {
    r: &'a mut R,
    order: ByteOrder,
    pos: u64,
}

impl<'a, R: Read> TagReader<'a, R> {
    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        self.pos += 4;
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(buf),
            ByteOrder::Big => u32::from_be_bytes(buf),
        })
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        std::io::copy(&mut self.r.by_ref().take(n), &mut std::io::sink())?;
        self.pos += n;
        Ok(())
    }

    fn expect(&mut self, what: &str, want: u32) -> Result<()> {
        let got = self.u32()?;
        if got != want {
            return Err(Error::Container(format!("expected {what} {want}, found {got}")));
        }
        Ok(())
    }
}

fn pad8(n: u64) -> u64 {
    (8 - n % 8) % 8
}

/// Parse the preamble and the matrix element header of a single-vector MAT-file
pub fn parse_header<R: Read>(r: &mut R) -> Result<Layout> {
    let mut preamble = [0u8; PREAMBLE_LEN as usize];
    r.read_exact(&mut preamble)?;
    let order = match &preamble[126..128] {
        b"IM" => ByteOrder::Little,
        b"MI" => ByteOrder::Big,
        other => {
            return Err(Error::Container(format!(
                "bad MAT endian indicator {other:?}"
            )))
        }
    };
    let mut tags = TagReader {
        r,
        order,
        pos: PREAMBLE_LEN,
    };

    tags.expect("matrix tag", MI_MATRIX)?;
    let _matrix_bytes = tags.u32()?;
    tags.expect("array flags tag", MI_UINT32)?;
    tags.expect("array flags size", 8)?;
    let dtype = Dtype::from_mat_class(tags.u32()? & 0xff)?;
    tags.u32()?;

    tags.expect("dimensions tag", MI_INT32)?;
    let dims_bytes = tags.u32()?;
    let mut count = 1u64;
    for _ in 0..dims_bytes / 4 {
        let dim = tags.u32()? as u64;
        count = count
            .checked_mul(dim)
            .ok_or_else(|| Error::Container("array dimensions overflow".into()))?;
    }
    tags.skip(pad8(dims_bytes as u64))?;

    // Array name, either packed into its tag or a regular element
    let name_tag = tags.u32()?;
    if name_tag >> 16 != 0 {
        tags.skip(4)?;
    } else {
        let n = tags.u32()? as u64;
        tags.skip(n + pad8(n))?;
    }

    let data_tag = tags.u32()?;
    let (data_type, data_bytes) = if data_tag >> 16 != 0 {
        (data_tag & 0xffff, (data_tag >> 16) as u64)
    } else {
        (data_tag, tags.u32()? as u64)
    };
    if data_type != dtype.mat_data_type() {
        return Err(Error::Container(format!(
            "data type {data_type} does not match array class of {dtype:?}"
        )));
    }
    if count.checked_mul(dtype.size() as u64) != Some(data_bytes) {
        return Err(Error::Container(format!(
            "dimensions claim {count} elements but the data element holds {data_bytes} bytes"
        )));
    }
    Ok(Layout {
        dtype,
        order,
        data_offset: tags.pos,
        data_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn word_at(bytes: &[u8], offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[offset..offset + 4]);
        u32::from_ne_bytes(buf)
    }

    #[test]
    fn test_header_offsets() {
        let mut cur = Cursor::new(vec![]);
        write_header(&mut cur, Dtype::F64).unwrap();
        let bytes = cur.into_inner();
        assert_eq!(bytes.len() as u64, DATA_OFFSET);
        assert!(bytes.starts_with(b"MATLAB 5.0 MAT-file"));
        assert_eq!(&bytes[116..124], &[0u8; 8]);
        assert_eq!(u16::from_ne_bytes([bytes[124], bytes[125]]), 0x0100);
        if cfg!(target_endian = "little") {
            assert_eq!(&bytes[126..128], b"IM");
        }
        assert_eq!(word_at(&bytes, 128), 14);
        assert_eq!(word_at(&bytes, 132), 0);
        assert_eq!(word_at(&bytes, 140), 8);
        assert_eq!(word_at(&bytes, 144), 6);
        assert_eq!(word_at(&bytes, 148), 0);
        assert_eq!(word_at(&bytes, 156), 8);
        assert_eq!(word_at(&bytes, 160), 1);
        assert_eq!(word_at(&bytes, 164), 0);
        assert_eq!(word_at(&bytes, 168), (4 << 16) | 1);
        assert_eq!(&bytes[172..176], b"data");
        assert_eq!(word_at(&bytes, 176), 9);
        assert_eq!(word_at(&bytes, 180), 0);
    }

    #[test]
    fn test_patch_pads_and_fills_sizes() {
        let mut cur = Cursor::new(vec![]);
        write_header(&mut cur, Dtype::I16).unwrap();
        // Three i16 = 6 bytes, needs 2 bytes of padding
        cur.write_all(&[1, 0, 2, 0, 3, 0]).unwrap();
        patch(&mut cur, Dtype::I16).unwrap();
        let bytes = cur.into_inner();
        assert_eq!(bytes.len(), 192);
        assert_eq!(&bytes[190..192], &[0, 0]);
        assert_eq!(word_at(&bytes, 132), 192 - 136);
        assert_eq!(word_at(&bytes, 164), 3);
        assert_eq!(word_at(&bytes, 180), 6);

        let layout = parse_header(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(layout.dtype, Dtype::I16);
        assert_eq!(layout.data_offset, DATA_OFFSET);
        assert_eq!(layout.data_bytes, 6);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let junk = vec![0u8; 256];
        assert!(matches!(
            parse_header(&mut Cursor::new(junk)),
            Err(Error::Container(_))
        ));
    }

    #[test]
    fn test_parse_rejects_huge_dimensions() {
        let mut cur = Cursor::new(vec![]);
        write_header(&mut cur, Dtype::I16).unwrap();
        let clean = cur.into_inner();
        let set = |bytes: &mut Vec<u8>, offset: usize, word: u32| {
            bytes[offset..offset + 4].copy_from_slice(&word.to_ne_bytes())
        };

        // Three maximal dimensions overflow the element count
        let mut cube = clean.clone();
        set(&mut cube, 156, 12);
        for offset in [160, 164, 168] {
            set(&mut cube, offset, u32::MAX);
        }
        assert!(matches!(
            parse_header(&mut Cursor::new(cube)),
            Err(Error::Container(_))
        ));

        // Two fit in the count but not once multiplied by the element size
        let mut square = clean;
        set(&mut square, 160, u32::MAX);
        set(&mut square, 164, u32::MAX);
        assert!(matches!(
            parse_header(&mut Cursor::new(square)),
            Err(Error::Container(_))
        ));
    }
}
