//! Fixed-width row storage for tokenized fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Field name → arrays produced for that field, in production order.
pub type TokenizedData = BTreeMap<String, Vec<FieldArray>>;

/// Element storage. Integer widths are chosen from the largest value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayValues {
    U16(Vec<u16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
}

impl ArrayValues {
    fn len(&self) -> usize {
        match self {
            Self::U16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Str(v) => v.len(),
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self, Self::U16(_) | Self::I32(_) | Self::I64(_))
    }

    fn integer_rank(&self) -> u8 {
        match self {
            Self::U16(_) => 0,
            Self::I32(_) => 1,
            _ => 2,
        }
    }

    fn to_i64(&self) -> Option<Vec<i64>> {
        match self {
            Self::U16(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::I32(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::I64(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn narrowest(values: Vec<i64>, min_rank: u8) -> Self {
        let min = values.iter().copied().min().unwrap_or(0);
        let max = values.iter().copied().max().unwrap_or(0);
        if min_rank == 0 && min >= 0 && max <= i64::from(u16::MAX) {
            Self::U16(values.into_iter().map(|x| x as u16).collect())
        } else if min_rank <= 1 && min >= i64::from(i32::MIN) && max <= i64::from(i32::MAX) {
            Self::I32(values.into_iter().map(|x| x as i32).collect())
        } else {
            Self::I64(values)
        }
    }

    fn gather(&self, width: usize, rows: &[usize]) -> Self {
        fn pick<T: Clone>(v: &[T], width: usize, rows: &[usize]) -> Vec<T> {
            let mut out = Vec::with_capacity(rows.len() * width);
            for &row in rows {
                out.extend_from_slice(&v[row * width..(row + 1) * width]);
            }
            out
        }
        match self {
            Self::U16(v) => Self::U16(pick(v, width, rows)),
            Self::I32(v) => Self::I32(pick(v, width, rows)),
            Self::I64(v) => Self::I64(pick(v, width, rows)),
            Self::Bool(v) => Self::Bool(pick(v, width, rows)),
            Self::Str(v) => Self::Str(pick(v, width, rows)),
        }
    }
}

/// A row-major array whose first dimension is the example count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldArray {
    row_shape: Vec<usize>,
    rows: usize,
    values: ArrayValues,
}

impl FieldArray {
    fn new(row_shape: Vec<usize>, values: ArrayValues) -> Result<Self> {
        let width: usize = row_shape.iter().product();
        let len = values.len();
        let rows = if width == 0 {
            0
        } else if len % width == 0 {
            len / width
        } else {
            return Err(PipelineError::Shard(format!(
                "{len} values do not fill rows of shape {row_shape:?}"
            )));
        };
        Ok(Self {
            row_shape,
            rows,
            values,
        })
    }

    /// Token ids stored with the narrowest integer width that holds them.
    pub fn from_ids(row_shape: Vec<usize>, ids: Vec<u32>) -> Result<Self> {
        let values = ArrayValues::narrowest(ids.into_iter().map(i64::from).collect(), 0);
        Self::new(row_shape, values)
    }

    /// Flag fields emitted by custom generators.
    pub fn from_bools(row_shape: Vec<usize>, values: Vec<bool>) -> Result<Self> {
        Self::new(row_shape, ArrayValues::Bool(values))
    }

    pub fn from_strings(row_shape: Vec<usize>, values: Vec<String>) -> Result<Self> {
        Self::new(row_shape, ArrayValues::Str(values))
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row_shape(&self) -> &[usize] {
        &self.row_shape
    }

    pub fn values(&self) -> &ArrayValues {
        &self.values
    }

    fn row_width(&self) -> usize {
        self.row_shape.iter().product()
    }

    pub fn dtype(&self) -> &'static str {
        match self.values {
            ArrayValues::U16(_) => "uint16",
            ArrayValues::I32(_) => "int32",
            ArrayValues::I64(_) => "int64",
            ArrayValues::Bool(_) => "bool",
            ArrayValues::Str(_) => "str",
        }
    }

    /// Approximate in-memory size of the stored values.
    pub fn byte_size(&self) -> u64 {
        let bytes = match &self.values {
            ArrayValues::U16(v) => v.len() * 2,
            ArrayValues::I32(v) => v.len() * 4,
            ArrayValues::I64(v) => v.len() * 8,
            ArrayValues::Bool(v) => v.len(),
            ArrayValues::Str(v) => v.iter().map(String::len).sum(),
        };
        bytes as u64
    }

    /// Integer row `index` widened to `i64`.
    pub fn int_row(&self, index: usize) -> Option<Vec<i64>> {
        if index >= self.rows {
            return None;
        }
        let width = self.row_width();
        let gathered = self.values.gather(width, &[index]);
        gathered.to_i64()
    }

    /// New array holding `rows` in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&row| row >= self.rows) {
            return Err(PipelineError::Shard(format!(
                "row {bad} out of range for an array of {} rows",
                self.rows
            )));
        }
        Ok(Self {
            row_shape: self.row_shape.clone(),
            rows: rows.len(),
            values: self.values.gather(self.row_width(), rows),
        })
    }

    /// Concatenate along the row dimension, widening integers as needed.
    pub fn concat(parts: &[FieldArray]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| PipelineError::Shard("cannot concatenate zero arrays".to_string()))?;
        if let Some(other) = parts.iter().find(|p| p.row_shape != first.row_shape) {
            return Err(PipelineError::Shard(format!(
                "row shape mismatch: {:?} vs {:?}",
                first.row_shape, other.row_shape
            )));
        }
        let rows = parts.iter().map(|p| p.rows).sum();
        let values = if parts.iter().all(|p| p.values.is_integer()) {
            let rank = parts.iter().map(|p| p.values.integer_rank()).max().unwrap_or(0);
            let mut all = Vec::new();
            for part in parts {
                all.extend(part.values.to_i64().unwrap_or_default());
            }
            ArrayValues::narrowest(all, rank)
        } else {
            match &first.values {
                ArrayValues::Bool(_) => {
                    let mut all = Vec::new();
                    for part in parts {
                        match &part.values {
                            ArrayValues::Bool(v) => all.extend_from_slice(v),
                            _ => return Err(dtype_mismatch(first, part)),
                        }
                    }
                    ArrayValues::Bool(all)
                }
                ArrayValues::Str(_) => {
                    let mut all = Vec::new();
                    for part in parts {
                        match &part.values {
                            ArrayValues::Str(v) => all.extend_from_slice(v),
                            _ => return Err(dtype_mismatch(first, part)),
                        }
                    }
                    ArrayValues::Str(all)
                }
                _ => {
                    let other = parts.iter().find(|p| !p.values.is_integer()).unwrap_or(first);
                    return Err(dtype_mismatch(first, other));
                }
            }
        };
        Ok(Self {
            row_shape: first.row_shape.clone(),
            rows,
            values,
        })
    }
}

fn dtype_mismatch(a: &FieldArray, b: &FieldArray) -> PipelineError {
    PipelineError::Shard(format!(
        "cannot combine {} and {} arrays",
        a.dtype(),
        b.dtype()
    ))
}
