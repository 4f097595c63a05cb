//! NumPy `.npy` v1.0 file holding a single 1-D array.
//!
//! The header dict is padded to a fixed width so the shape can be rewritten in
//! place once the element count is known.

use std::io::{Read, Seek, SeekFrom, Write};

use super::{ByteOrder, Dtype};
use crate::{Error, Result};

pub const MAGIC: &[u8] = b"\x93NUMPY";
/// Magic + version + header length + dict, always this long for files we write
pub const PREAMBLE_LEN: u64 = 128;
const DICT_OFFSET: u64 = 10;

impl Dtype {
    fn npy_code(self) -> &'static str {
        match self {
            Dtype::F64 => "f8",
            Dtype::I16 => "i2",
        }
    }
}

fn dict_text(dtype: Dtype, count: u64) -> Vec<u8> {
    let order = match ByteOrder::native() {
        ByteOrder::Little => '<',
        ByteOrder::Big => '>',
    };
    let mut text = format!(
        "{{'descr': '{}{}', 'fortran_order': False, 'shape': ({},), }}",
        order,
        dtype.npy_code(),
        count
    )
    .into_bytes();
    // Even u64::MAX elements leaves plenty of room
    text.resize((PREAMBLE_LEN - DICT_OFFSET - 1) as usize, b' ');
    text.push(b'\n');
    text
}

pub fn write_header<W: Write>(w: &mut W, dtype: Dtype) -> std::io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&[1, 0])?;
    w.write_all(&((PREAMBLE_LEN - DICT_OFFSET) as u16).to_le_bytes())?;
    w.write_all(&dict_text(dtype, 0))
}

/// Rewrite the shape with the element count implied by the bytes after the header.
/// `w` must be positioned at the end of the data.
pub fn patch<W: Write + Seek>(w: &mut W, dtype: Dtype) -> Result<()> {
    let end = w.stream_position()?;
    let count = (end - PREAMBLE_LEN) / dtype.size() as u64;
    w.seek(SeekFrom::Start(DICT_OFFSET))?;
    w.write_all(&dict_text(dtype, count))?;
    w.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Where the elements live in an npy file and how to decode them
pub struct Layout {
    pub dtype: Dtype,
    pub order: ByteOrder,
    pub data_offset: u64,
    pub count: u64,
}

fn dict_value<'a>(dict: &'a str, key: &str) -> Result<&'a str> {
    let needle = format!("'{key}':");
    let start = dict
        .find(&needle)
        .ok_or_else(|| Error::Container(format!("npy header has no {key}")))?;
    Ok(dict[start + needle.len()..].trim_start())
}

fn parse_descr(dict: &str) -> Result<(Dtype, ByteOrder)> {
    let value = dict_value(dict, "descr")?;
    let descr = value
        .strip_prefix('\'')
        .and_then(|v| v.split('\'').next())
        .ok_or_else(|| Error::Container(format!("bad descr in {dict}")))?;
    let (order, code) = descr.split_at(1.min(descr.len()));
    let order = match order {
        "<" => ByteOrder::Little,
        ">" => ByteOrder::Big,
        "=" | "|" => ByteOrder::native(),
        _ => return Err(Error::Container(format!("bad byte order in {descr}"))),
    };
    let dtype = match code {
        "f8" => Dtype::F64,
        "i2" => Dtype::I16,
        other => return Err(Error::Container(format!("unsupported dtype {other}"))),
    };
    Ok((dtype, order))
}

fn parse_shape(dict: &str) -> Result<u64> {
    let value = dict_value(dict, "shape")?;
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.split(')').next())
        .ok_or_else(|| Error::Container(format!("bad shape in {dict}")))?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .try_fold(1u64, |acc, dim| {
            dim.parse::<u64>()
                .map(|d| acc * d)
                .map_err(|_| Error::Container(format!("bad dimension {dim}")))
        })
}

pub fn parse_header<R: Read>(r: &mut R) -> Result<Layout> {
    let mut lead = [0u8; 8];
    r.read_exact(&mut lead)?;
    if &lead[..6] != MAGIC {
        return Err(Error::Container("missing npy magic".into()));
    }
    let (dict_len, dict_offset) = match lead[6] {
        1 => {
            let mut len = [0u8; 2];
            r.read_exact(&mut len)?;
            (u16::from_le_bytes(len) as usize, 10)
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            r.read_exact(&mut len)?;
            (u32::from_le_bytes(len) as usize, 12)
        }
        v => return Err(Error::Container(format!("unsupported npy version {v}"))),
    };
    let mut dict = vec![0u8; dict_len];
    r.read_exact(&mut dict)?;
    let dict = String::from_utf8_lossy(&dict);
    if dict.contains("'fortran_order': True") {
        return Err(Error::Container("fortran ordered arrays are not supported".into()));
    }
    let (dtype, order) = parse_descr(&dict)?;
    Ok(Layout {
        dtype,
        order,
        data_offset: dict_offset + dict_len as u64,
        count: parse_shape(&dict)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_is_fixed_width() {
        let mut cur = Cursor::new(vec![]);
        write_header(&mut cur, Dtype::I16).unwrap();
        let bytes = cur.into_inner();
        assert_eq!(bytes.len() as u64, PREAMBLE_LEN);
        assert_eq!(&bytes[..8], b"\x93NUMPY\x01\x00");
        assert_eq!(bytes[127], b'\n');
        assert_eq!(PREAMBLE_LEN % 64, 0);
    }

    #[test]
    fn test_patch_keeps_header_length() {
        let mut cur = Cursor::new(vec![]);
        write_header(&mut cur, Dtype::F64).unwrap();
        cur.write_all(&[0u8; 8 * 1234]).unwrap();
        patch(&mut cur, Dtype::F64).unwrap();
        let bytes = cur.into_inner();
        assert_eq!(bytes.len(), 128 + 8 * 1234);
        let text = String::from_utf8_lossy(&bytes[10..128]);
        assert!(text.contains("'shape': (1234,)"), "{text}");

        let layout = parse_header(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(layout.count, 1234);
        assert_eq!(layout.data_offset, PREAMBLE_LEN);
        assert_eq!(layout.dtype, Dtype::F64);
    }

    #[test]
    fn test_parse_foreign_header() {
        let dict = "{'descr': '<i2', 'fortran_order': False, 'shape': (3, 4), }";
        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend((dict.len() as u16).to_le_bytes());
        bytes.extend(dict.as_bytes());
        let layout = parse_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(layout.count, 12);
        assert_eq!(layout.order, ByteOrder::Little);
        assert_eq!(layout.dtype, Dtype::I16);
    }
}
