//! Minimal reader/writer for 2-D NumPy `.npy` matrices.
//!
//! Supports format versions 1.0-3.0, C order, little-endian `f4` or `f8`
//! (`f8` is narrowed to `f32`).

use std::io::{BufReader, Read, Write};
use std::path::Path;

use ndarray::Array2;
use thiserror::Error;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid npy file: {0}")]
    InvalidFormat(String),
    #[error("unsupported npy data: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Dtype {
    F32,
    F64,
}

impl Dtype {
    fn size(self) -> usize {
        match self {
            Dtype::F32 => 4,
            Dtype::F64 => 8,
        }
    }
}

#[derive(Debug)]
struct Header {
    dtype: Dtype,
    fortran_order: bool,
    shape: Vec<usize>,
}

pub fn read_matrix(path: &Path) -> Result<Array2<f32>, NpyError> {
    let file = std::fs::File::open(path)?;
    read_matrix_from(&mut BufReader::new(file))
}

pub fn read_matrix_from(r: &mut dyn Read) -> Result<Array2<f32>, NpyError> {
    let mut magic = [0u8; 6];
    r.read_exact(&mut magic)?;
    if &magic != NPY_MAGIC {
        return Err(NpyError::InvalidFormat("bad magic".to_string()));
    }

    let mut version = [0u8; 2];
    r.read_exact(&mut version)?;
    let header_len = match version[0] {
        1 => {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf)?;
            u16::from_le_bytes(buf) as usize
        }
        2 | 3 => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            u32::from_le_bytes(buf) as usize
        }
        v => return Err(NpyError::Unsupported(format!("format version {v}"))),
    };

    let mut raw = vec![0u8; header_len];
    r.read_exact(&mut raw)?;
    // Version 3 allows utf-8; the keys we need are ascii either way.
    let text = String::from_utf8_lossy(&raw);
    let header = parse_header(&text)?;

    if header.fortran_order {
        return Err(NpyError::Unsupported("fortran order".to_string()));
    }
    let (rows, cols) = match header.shape.as_slice() {
        [rows, cols] => (*rows, *cols),
        other => {
            return Err(NpyError::Unsupported(format!(
                "expected a 2-d array, got shape {other:?}"
            )))
        }
    };

    let byte_len = rows
        .checked_mul(cols)
        .and_then(|count| count.checked_mul(header.dtype.size()))
        .ok_or_else(|| NpyError::InvalidFormat("shape overflows".to_string()))?;
    // Sized by the bytes actually present, not the declared shape.
    let mut data = Vec::new();
    Read::take(r, byte_len as u64).read_to_end(&mut data)?;
    if data.len() != byte_len {
        return Err(NpyError::InvalidFormat(format!(
            "truncated data, expected {byte_len} bytes, found {}",
            data.len()
        )));
    }

    let values: Vec<f32> = match header.dtype {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b) as f32
            })
            .collect(),
    };

    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| NpyError::InvalidFormat(e.to_string()))
}

/// Write a matrix as a version 1.0 `<f4` file.
pub fn write_matrix(path: &Path, matrix: &Array2<f32>) -> Result<(), NpyError> {
    let (rows, cols) = matrix.dim();
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, {cols}), }}"
    );
    // magic + version + len + header + newline is padded to a multiple of 64.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut out = Vec::with_capacity(NPY_MAGIC.len() + 4 + header.len() + rows * cols * 4);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in matrix.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }

    let mut file = std::fs::File::create(path)?;
    file.write_all(&out)?;
    Ok(())
}

fn parse_header(text: &str) -> Result<Header, NpyError> {
    let descr = dict_value(text, "descr")?;
    let descr = descr.trim().trim_matches(|c| c == '\'' || c == '"');
    let dtype = match descr {
        "<f4" | "=f4" | "f4" => Dtype::F32,
        "<f8" | "=f8" | "f8" => Dtype::F64,
        other => return Err(NpyError::Unsupported(format!("dtype {other}"))),
    };

    let fortran_order = match dict_value(text, "fortran_order")?.trim() {
        "False" => false,
        "True" => true,
        other => {
            return Err(NpyError::InvalidFormat(format!(
                "fortran_order value {other}"
            )))
        }
    };

    let shape_text = dict_value(text, "shape")?;
    let inner = shape_text
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| NpyError::InvalidFormat(format!("shape {shape_text}")))?;
    let shape = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpyError::InvalidFormat(format!("shape element {s}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Header {
        dtype,
        fortran_order,
        shape,
    })
}

/// Raw text of the value stored under `key` in the header dict literal.
fn dict_value<'a>(text: &'a str, key: &str) -> Result<&'a str, NpyError> {
    let missing = || NpyError::InvalidFormat(format!("header has no '{key}'"));
    let start = text
        .find(&format!("'{key}'"))
        .or_else(|| text.find(&format!("\"{key}\"")))
        .ok_or_else(missing)?;
    let rest = &text[start + key.len() + 2..];
    let rest = rest.trim_start().strip_prefix(':').ok_or_else(missing)?;

    // The value ends at the first comma outside parentheses or at the closing brace.
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' | '}' if depth == 0 => return Ok(&rest[..i]),
            _ => {}
        }
    }
    Err(missing())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npy_bytes(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = NPY_MAGIC.to_vec();
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.npy");
        let m = Array2::from_shape_fn((3, 5), |(r, c)| r as f32 * 10.0 + c as f32 * 0.5);
        write_matrix(&path, &m).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!((bytes.len() - 3 * 5 * 4) % 64, 0);
        assert_eq!(read_matrix(&path).unwrap(), m);
    }

    #[test]
    fn reads_f8_as_f32() {
        let payload: Vec<u8> = [1.5f64, -2.0, 0.25, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bytes = npy_bytes(
            "{'descr': '<f8', 'fortran_order': False, 'shape': (2, 2), }\n",
            &payload,
        );
        let m = read_matrix_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(m, ndarray::arr2(&[[1.5f32, -2.0], [0.25, 4.0]]));
    }

    #[test]
    fn rejects_bad_inputs() {
        let f4 = |shape: &str, order: &str, n: usize| {
            npy_bytes(
                &format!("{{'descr': '<f4', 'fortran_order': {order}, 'shape': {shape}, }}\n"),
                &vec![0u8; n * 4],
            )
        };

        let one_d = f4("(4,)", "False", 4);
        assert!(matches!(
            read_matrix_from(&mut one_d.as_slice()),
            Err(NpyError::Unsupported(_))
        ));

        let fortran = f4("(2, 2)", "True", 4);
        assert!(matches!(
            read_matrix_from(&mut fortran.as_slice()),
            Err(NpyError::Unsupported(_))
        ));

        let truncated = f4("(2, 3)", "False", 5);
        assert!(matches!(
            read_matrix_from(&mut truncated.as_slice()),
            Err(NpyError::InvalidFormat(_))
        ));

        let ints = npy_bytes(
            "{'descr': '<i8', 'fortran_order': False, 'shape': (1, 1), }\n",
            &[0u8; 8],
        );
        assert!(matches!(
            read_matrix_from(&mut ints.as_slice()),
            Err(NpyError::Unsupported(_))
        ));

        let garbage = b"PK\x03\x04 definitely a zip".to_vec();
        assert!(matches!(
            read_matrix_from(&mut garbage.as_slice()),
            Err(NpyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn oversized_shape_is_rejected() {
        // rows * cols fits in usize, the byte length does not.
        let huge = npy_bytes(
            "{'descr': '<f4', 'fortran_order': False, 'shape': (4611686018427387904, 2), }\n",
            &[0u8; 16],
        );
        assert!(matches!(
            read_matrix_from(&mut huge.as_slice()),
            Err(NpyError::InvalidFormat(_))
        ));

        // Representable, but far more than the file holds.
        let short = npy_bytes(
            "{'descr': '<f8', 'fortran_order': False, 'shape': (1000000000, 128), }\n",
            &[0u8; 64],
        );
        assert!(matches!(
            read_matrix_from(&mut short.as_slice()),
            Err(NpyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn empty_gallery_shape() {
        let bytes = npy_bytes(
            "{'descr': '<f4', 'fortran_order': False, 'shape': (0, 128), }\n",
            &[],
        );
        let m = read_matrix_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(m.dim(), (0, 128));
    }
}
