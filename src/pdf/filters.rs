//! Stream decoding for the structures the loader has to read itself
//! (cross-reference streams and object streams).

use std::io::Read;

use flate2::read::ZlibDecoder;

use super::object::{Dictionary, Object, Stream};
use super::{PdfError, Result};

/// Decode a stream's content through its `/Filter` chain.
pub fn decode_stream(stream: &Stream) -> Result<Vec<u8>> {
    let filters: Vec<&[u8]> = match stream.dict.get(b"Filter") {
        None => Vec::new(),
        Some(Object::Name(name)) => vec![name.as_slice()],
        Some(Object::Array(items)) => items
            .iter()
            .map(|item| item.as_name())
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(PdfError::TypeMismatch {
                expected: "name or array",
                found: other.type_name(),
            });
        }
    };

    let params: Vec<Option<&Dictionary>> = match stream.dict.get(b"DecodeParms") {
        Some(Object::Dictionary(dict)) => vec![Some(dict)],
        Some(Object::Array(items)) => items.iter().map(|item| item.as_dict().ok()).collect(),
        _ => Vec::new(),
    };

    let mut data = stream.content.clone();
    for (index, filter) in filters.iter().enumerate() {
        let parms = params.get(index).copied().flatten();
        data = match *filter {
            b"FlateDecode" | b"Fl" => {
                let inflated = inflate(&data)?;
                apply_predictor(inflated, parms)?
            }
            other => {
                return Err(PdfError::UnsupportedFilter(
                    String::from_utf8_lossy(other).into_owned(),
                ));
            }
        };
    }
    Ok(data)
}

/// Ceiling on inflated xref/object stream data.
const MAX_INFLATED: u64 = 256 * 1024 * 1024;

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(MAX_INFLATED + 1);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) if out.len() as u64 > MAX_INFLATED => Err(PdfError::Decode(format!(
            "stream inflates beyond {} bytes",
            MAX_INFLATED
        ))),
        Ok(_) => Ok(out),
        // Truncated or checksum-damaged streams still yield usable output
        Err(_) if !out.is_empty() => {
            tracing::debug!(recovered = out.len(), "Recovered partial flate stream");
            Ok(out)
        }
        Err(e) => Err(PdfError::Decode(e.to_string())),
    }
}

fn apply_predictor(data: Vec<u8>, parms: Option<&Dictionary>) -> Result<Vec<u8>> {
    let Some(parms) = parms else {
        return Ok(data);
    };
    let predictor = parms.get_i64(b"Predictor").unwrap_or(1);
    if predictor < 10 || data.is_empty() {
        // 1 = none; TIFF predictor 2 never appears in xref or object streams
        return Ok(data);
    }

    let parm = |key: &[u8], default: i64| {
        usize::try_from(parms.get_i64(key).unwrap_or(default).max(1)).unwrap_or(usize::MAX)
    };
    let colors = parm(b"Colors", 1);
    let bits = parm(b"BitsPerComponent", 8);
    let columns = parm(b"Columns", 1);

    let bits_per_pixel = colors
        .checked_mul(bits)
        .ok_or_else(|| PdfError::Decode("predictor pixel size out of range".into()))?;
    let bytes_per_pixel = bits_per_pixel.div_ceil(8).max(1);
    let row_len = bits_per_pixel
        .checked_mul(columns)
        .map(|bits| bits.div_ceil(8))
        .filter(|&len| len < data.len())
        .ok_or_else(|| {
            PdfError::Decode(format!("predictor rows do not fit {} bytes of data", data.len()))
        })?;

    let mut out = Vec::with_capacity(data.len());
    let mut previous = vec![0u8; row_len];

    for chunk in data.chunks(row_len + 1) {
        if chunk.len() < 2 {
            break;
        }
        let filter_type = chunk[0];
        let mut row = chunk[1..].to_vec();
        row.resize(row_len, 0);

        for i in 0..row_len {
            let left = if i >= bytes_per_pixel { row[i - bytes_per_pixel] } else { 0 };
            let up = previous[i];
            let up_left = if i >= bytes_per_pixel {
                previous[i - bytes_per_pixel]
            } else {
                0
            };
            row[i] = match filter_type {
                0 => row[i],
                1 => row[i].wrapping_add(left),
                2 => row[i].wrapping_add(up),
                3 => row[i].wrapping_add(((u16::from(left) + u16::from(up)) / 2) as u8),
                4 => row[i].wrapping_add(paeth(left, up, up_left)),
                other => {
                    return Err(PdfError::Decode(format!("unknown PNG filter type {}", other)));
                }
            };
        }

        out.extend_from_slice(&row);
        previous = row;
    }

    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = i16::from(a) + i16::from(b) - i16::from(c);
    let pa = (p - i16::from(a)).abs();
    let pb = (p - i16::from(b)).abs();
    let pc = (p - i16::from(c)).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}
