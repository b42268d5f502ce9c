use crate::error::{MapperError, Result};

/// A dense boolean matrix packed eight columns to the byte, row major.
/// Backs the `(n_genes, n_pairs)` marker masks, which would be an order
/// of magnitude too large stored as one byte per flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMatrix {
    n_rows: usize,
    n_cols: usize,
    row_bytes: usize,
    data: Vec<u8>,
}

impl BitMatrix {
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        let row_bytes = n_cols.div_ceil(8);
        Self {
            n_rows,
            n_cols,
            row_bytes,
            data: vec![0u8; n_rows * row_bytes],
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> bool {
        let byte = self.data[row * self.row_bytes + col / 8];
        byte & (1u8 << (col % 8)) != 0
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: bool) {
        let byte = &mut self.data[row * self.row_bytes + col / 8];
        let mask = 1u8 << (col % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    pub fn set_col(&mut self, col: usize, values: &[bool]) {
        debug_assert_eq!(values.len(), self.n_rows);
        for (row, &value) in values.iter().enumerate() {
            self.set(row, col, value);
        }
    }

    /// The packed bytes of one row.
    pub fn row_slice(&self, row: usize) -> &[u8] {
        &self.data[row * self.row_bytes..(row + 1) * self.row_bytes]
    }

    /// Column indices set in one row.
    pub fn row_indices(&self, row: usize) -> Vec<usize> {
        let mut out = Vec::new();
        for (byte_idx, &byte) in self.row_slice(row).iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if byte & (1u8 << bit) != 0 {
                    let col = byte_idx * 8 + bit;
                    if col < self.n_cols {
                        out.push(col);
                    }
                }
            }
        }
        out
    }

    /// Write into `group` as datasets `data`, `n_rows`, `n_cols`.
    pub fn write_to_group(&self, group: &hdf5::Group) -> Result<()> {
        group
            .new_dataset_builder()
            .with_data(&self.data)
            .create("data")?;
        group
            .new_dataset_builder()
            .with_data(&[self.n_rows as i64])
            .create("n_rows")?;
        group
            .new_dataset_builder()
            .with_data(&[self.n_cols as i64])
            .create("n_cols")?;
        Ok(())
    }

    pub fn read_from_group(group: &hdf5::Group) -> Result<Self> {
        let n_rows = read_scalar_usize(group, "n_rows")?;
        let n_cols = read_scalar_usize(group, "n_cols")?;
        let data: Vec<u8> = group.dataset("data")?.read_raw()?;
        let row_bytes = n_cols.div_ceil(8);
        if data.len() != n_rows * row_bytes {
            return Err(MapperError::MalformedMatrix(format!(
                "bit matrix has {} bytes, expected {} for shape ({n_rows}, {n_cols})",
                data.len(),
                n_rows * row_bytes
            )));
        }
        Ok(Self {
            n_rows,
            n_cols,
            row_bytes,
            data,
        })
    }
}

fn read_scalar_usize(group: &hdf5::Group, name: &str) -> Result<usize> {
    let raw: Vec<i64> = group.dataset(name)?.read_raw()?;
    raw.first()
        .copied()
        .filter(|&v| v >= 0)
        .map(|v| v as usize)
        .ok_or_else(|| MapperError::MalformedMatrix(format!("bad scalar dataset {name}")))
}
