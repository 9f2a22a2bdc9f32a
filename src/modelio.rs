//! Parameter checkpoints.
//!
//! # `.bpat` Format
//!
//! A checkpoint stores a module's parameter list, in [`Module::parameters`]
//! order, as a flat sequence of matrices:
//!
//! ```text
//! ┌────────────┬─────────────────────────────────┐
//! │ Header     │ Record (repeated `count` times) │
//! ├────────────┼─────────────────────────────────┤
//! │ "bpat"[4]  │ u64: ndim (always 2)            │
//! │ u8: count  │ [u64; ndim] shape               │
//! │            │ [f64; prod(shape)] data         │
//! └────────────┴─────────────────────────────────┘
//! ```
//!
//! All integers and floats are little-endian; data is row-major.
//!
//! # Limitations
//! - At most 255 parameters per file (`u8` count)
//! - No names or dtypes; records are matched to parameters by position
//!
//! # Example
//!
//! ```no_run
//! use mlscript::modelio::{load_parameters, save_parameters};
//! use mlscript::nn::{Module, Sequential};
//!
//! # fn main() -> mlscript::Result<()> {
//! let net = Sequential::builder(2).dense(3).build();
//! save_parameters("model.bpat", &net.parameters())?;
//!
//! let restored = Sequential::builder(2).dense(3).build();
//! load_parameters("model.bpat", &restored.parameters())?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Module::parameters`]: crate::nn::Module::parameters

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use briny::prelude::{TrustedData, Validate, ValidationError};

use crate::error::{Error, Result};
use crate::tensors::{Matrix, Tensor};

const BPAT_MAGIC: &[u8; 4] = b"bpat";

/// A record as read from disk, before its size has been checked.
struct PackedMatrix {
    shape: Vec<u64>,
    data: Vec<f64>,
}

impl Validate for PackedMatrix {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let expected = self
            .shape
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(d))
            .ok_or(ValidationError)?;
        if self.shape.len() != 2 || self.data.len() as u64 != expected {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn corrupt(what: &str) -> Error {
    Error::Checkpoint(what.to_owned())
}

fn to_usize(x: u64) -> Result<usize> {
    usize::try_from(x).map_err(|_| corrupt("dimension does not fit in memory"))
}

/// Writes `params` to `writer` in `.bpat` format.
///
/// # Errors
/// - [`Error::Checkpoint`] if there are more than 255 parameters
/// - [`Error::Io`] on write failure
pub fn write_parameters<W: Write>(mut writer: W, params: &[Tensor]) -> Result<()> {
    let count = u8::try_from(params.len()).map_err(|_| corrupt("more than 255 parameters"))?;
    writer.write_all(BPAT_MAGIC)?;
    writer.write_all(&[count])?;

    for param in params {
        let value = param.value();
        let (rows, cols) = value.shape();
        writer.write_all(&2u64.to_le_bytes())?;
        writer.write_all(&(rows as u64).to_le_bytes())?;
        writer.write_all(&(cols as u64).to_le_bytes())?;
        for &x in value.data() {
            writer.write_all(&x.to_le_bytes())?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// Reads every record of a `.bpat` stream.
///
/// # Errors
/// - [`Error::Checkpoint`] on a bad magic header or a malformed record
/// - [`Error::Io`] on read failure, including truncation
pub fn read_parameters<R: Read>(mut reader: R) -> Result<Vec<Matrix>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != BPAT_MAGIC {
        return Err(corrupt("invalid magic header"));
    }

    let mut count = [0u8; 1];
    reader.read_exact(&mut count)?;
    let count = usize::from(count[0]);

    let mut buf8 = [0u8; 8];
    let mut read_u64 = |reader: &mut R| -> Result<u64> {
        reader.read_exact(&mut buf8)?;
        Ok(u64::from_le_bytes(buf8))
    };

    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let ndim = read_u64(&mut reader)?;
        if ndim != 2 {
            return Err(corrupt("record is not a matrix"));
        }
        let shape = vec![read_u64(&mut reader)?, read_u64(&mut reader)?];
        let size = to_usize(shape[0])?
            .checked_mul(to_usize(shape[1])?)
            .ok_or_else(|| corrupt("record size overflows"))?;

        let mut data = Vec::new();
        for _ in 0..size {
            data.push(f64::from_bits(read_u64(&mut reader)?));
        }

        let packed = TrustedData::new(PackedMatrix { shape, data })
            .map_err(|_| corrupt("record failed validation"))?
            .into_inner();
        let rows = to_usize(packed.shape[0])?;
        let cols = to_usize(packed.shape[1])?;
        out.push(Matrix::new(rows, cols, packed.data)?);
    }

    Ok(out)
}

/// Saves `params` to the file at `path`, replacing it.
///
/// # Errors
/// See [`write_parameters`].
pub fn save_parameters(path: impl AsRef<Path>, params: &[Tensor]) -> Result<()> {
    let file = BufWriter::new(File::create(path.as_ref())?);
    write_parameters(file, params)?;
    tracing::debug!(path = %path.as_ref().display(), count = params.len(), "parameters saved");
    Ok(())
}

/// Loads the file at `path` into `params`, in place.
///
/// Every record must match the corresponding parameter's shape; on any
/// mismatch nothing is written.
///
/// # Errors
/// - [`Error::Checkpoint`] if the record count differs from `params.len()`
/// - [`Error::ShapeMismatch`] if a record's shape differs from its parameter's
/// - anything [`read_parameters`] returns
pub fn load_parameters(path: impl AsRef<Path>, params: &[Tensor]) -> Result<()> {
    let file = BufReader::new(File::open(path.as_ref())?);
    let records = read_parameters(file)?;
    if records.len() != params.len() {
        return Err(Error::Checkpoint(format!(
            "checkpoint holds {} parameters, expected {}",
            records.len(),
            params.len()
        )));
    }

    for (param, record) in params.iter().zip(&records) {
        if param.shape() != record.shape() {
            return Err(Error::shape(param.shape(), record.shape()));
        }
    }
    for (param, record) in params.iter().zip(records) {
        param.set_value(record)?;
    }

    tracing::debug!(path = %path.as_ref().display(), count = params.len(), "parameters loaded");
    Ok(())
}
