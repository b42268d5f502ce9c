pub mod row_iter;
pub mod transpose;

use std::path::Path;

use hdf5::types::VarLenUnicode;
use ndarray::{Array2, s};

use crate::error::{MapperError, Result};

pub use row_iter::{AnnDataRowIterator, RowChunk};
pub use transpose::transpose_sparse_on_disk;

/// On-disk layout of the `X` matrix of an h5ad-style file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixLayout {
    Csr,
    Csc,
    Dense,
}

/// Determine the layout and shape of `X`. Sparse layouts are groups
/// with an `encoding-type` attribute and a `shape` attribute; a dense
/// matrix is a plain 2-D dataset.
pub fn matrix_layout(file: &hdf5::File) -> Result<(MatrixLayout, usize, usize)> {
    if let Ok(group) = file.group("X") {
        let encoding = read_attr_string(&group, "encoding-type").unwrap_or_default();
        let shape = group.attr("shape")?.read_raw::<i64>()?;
        if shape.len() != 2 || shape[0] < 0 || shape[1] < 0 {
            return Err(MapperError::MalformedMatrix(
                "X shape attribute is not a pair of non-negative integers".into(),
            ));
        }
        let (n_rows, n_cols) = (shape[0] as usize, shape[1] as usize);
        let layout = if encoding.starts_with("csr") {
            MatrixLayout::Csr
        } else if encoding.starts_with("csc") {
            MatrixLayout::Csc
        } else {
            return Err(MapperError::MalformedMatrix(format!(
                "unsupported X encoding-type {encoding:?}"
            )));
        };
        return Ok((layout, n_rows, n_cols));
    }
    let ds = file.dataset("X")?;
    let shape = ds.shape();
    if shape.len() != 2 {
        return Err(MapperError::MalformedMatrix(format!(
            "dense X has {} dimensions, expected 2",
            shape.len()
        )));
    }
    Ok((MatrixLayout::Dense, shape[0], shape[1]))
}

/// Read a variable-length UTF-8 string dataset.
pub fn read_string_vec(ds: &hdf5::Dataset) -> Result<Vec<String>> {
    Ok(ds
        .read_raw::<VarLenUnicode>()?
        .into_iter()
        .map(|v| v.to_string())
        .collect())
}

/// Read a dataset holding one JSON-encoded string (scalar or length-1).
pub fn read_json_string(ds: &hdf5::Dataset) -> Result<String> {
    let raw = ds.read_raw::<VarLenUnicode>()?;
    raw.first()
        .map(|v| v.to_string())
        .ok_or_else(|| MapperError::MalformedMatrix("empty string dataset".into()))
}

/// Write a single JSON-encoded string dataset.
pub fn write_json_string(group: &hdf5::Group, name: &str, value: &str) -> Result<()> {
    let encoded: VarLenUnicode = value
        .parse()
        .map_err(|_| MapperError::MalformedMatrix(format!("{name} is not valid UTF-8")))?;
    group
        .new_dataset_builder()
        .with_data(&[encoded])
        .create(name)?;
    Ok(())
}

/// Cell ids from the `obs` table (or gene ids from `var`): the dataset
/// named by the group's `_index` attribute.
pub fn read_index_column(file: &hdf5::File, table: &str) -> Result<Vec<String>> {
    let group = file.group(table)?;
    let index_name =
        read_attr_string(&group, "_index").unwrap_or_else(|_| "_index".to_string());
    let ds = group.dataset(&index_name)?;
    read_string_vec(&ds)
}

/// Read a string attribute whether it was written as a scalar or as a
/// one-element array.
fn read_attr_string(group: &hdf5::Group, name: &str) -> Result<String> {
    let attr = group.attr(name)?;
    let raw = attr.read_raw::<VarLenUnicode>()?;
    raw.first()
        .map(|v| v.to_string())
        .ok_or_else(|| MapperError::MalformedMatrix(format!("empty attribute {name}")))
}

/// Reject an indptr that cannot describe `n_major` compressed rows over
/// `nnz` stored values.
pub fn validate_indptr(indptr: &[i64], n_major: usize, nnz: usize) -> Result<()> {
    if indptr.len() != n_major + 1 {
        return Err(MapperError::MalformedMatrix(format!(
            "indptr has length {}, expected {}",
            indptr.len(),
            n_major + 1
        )));
    }
    if indptr[0] != 0 {
        return Err(MapperError::MalformedMatrix(
            "indptr does not start at 0".into(),
        ));
    }
    for window in indptr.windows(2) {
        if window[1] < window[0] {
            return Err(MapperError::MalformedMatrix(
                "indptr is not monotone".into(),
            ));
        }
    }
    if indptr[n_major] as usize != nnz {
        return Err(MapperError::MalformedMatrix(format!(
            "indptr ends at {} but {} values are stored",
            indptr[n_major], nnz
        )));
    }
    Ok(())
}

/// Load rows `[r0, r1)` of a CSR matrix as a dense slab.
pub fn load_csr_slab(
    data: &hdf5::Dataset,
    indices: &hdf5::Dataset,
    indptr: &[i64],
    r0: usize,
    r1: usize,
    n_cols: usize,
) -> Result<Array2<f64>> {
    let i0 = indptr[r0] as usize;
    let i1 = indptr[r1] as usize;
    let mut out = Array2::<f64>::zeros((r1 - r0, n_cols));
    if i0 == i1 {
        return Ok(out);
    }
    let values = data.read_slice_1d::<f64, _>(s![i0..i1])?;
    let cols = indices.read_slice_1d::<i64, _>(s![i0..i1])?;
    for row in r0..r1 {
        let a = indptr[row] as usize - i0;
        let b = indptr[row + 1] as usize - i0;
        for k in a..b {
            let col = cols[k] as usize;
            if col >= n_cols {
                return Err(MapperError::MalformedMatrix(format!(
                    "column index {col} out of range for {n_cols} columns"
                )));
            }
            out[[row - r0, col]] = values[k];
        }
    }
    Ok(out)
}

/// Load an arbitrary set of CSR rows (in the order given) as a dense
/// slab. Used by the precompute engine to gather one cluster's cells.
pub fn load_csr_rows(
    data: &hdf5::Dataset,
    indices: &hdf5::Dataset,
    indptr: &[i64],
    rows: &[usize],
    n_cols: usize,
) -> Result<Array2<f64>> {
    let mut out = Array2::<f64>::zeros((rows.len(), n_cols));
    for (out_row, &row) in rows.iter().enumerate() {
        let i0 = indptr[row] as usize;
        let i1 = indptr[row + 1] as usize;
        if i0 == i1 {
            continue;
        }
        let values = data.read_slice_1d::<f64, _>(s![i0..i1])?;
        let cols = indices.read_slice_1d::<i64, _>(s![i0..i1])?;
        for k in 0..values.len() {
            let col = cols[k] as usize;
            if col >= n_cols {
                return Err(MapperError::MalformedMatrix(format!(
                    "column index {col} out of range for {n_cols} columns"
                )));
            }
            out[[out_row, col]] = values[k];
        }
    }
    Ok(out)
}

/// Create an h5ad-style file holding a matrix in the requested layout,
/// with `obs`/`var` index columns. The writing half of the §6 contract;
/// also what the test suites build their fixtures with.
pub fn write_anndata(
    path: &Path,
    dense: &Array2<f64>,
    layout: MatrixLayout,
    cell_names: &[String],
    gene_names: &[String],
) -> Result<()> {
    let file = hdf5::File::create(path)?;
    let (n_rows, n_cols) = (dense.nrows(), dense.ncols());
    match layout {
        MatrixLayout::Dense => {
            file.new_dataset_builder().with_data(dense).create("X")?;
        }
        MatrixLayout::Csr | MatrixLayout::Csc => {
            let group = file.create_group("X")?;
            let encoding: VarLenUnicode = match layout {
                MatrixLayout::Csr => "csr_matrix",
                _ => "csc_matrix",
            }
            .parse()
            .expect("static string");
            group
                .new_attr_builder()
                .with_data(&[encoding])
                .create("encoding-type")?;
            group
                .new_attr_builder()
                .with_data(&[n_rows as i64, n_cols as i64])
                .create("shape")?;

            let row_major = layout == MatrixLayout::Csr;
            let (n_major, n_minor) = if row_major {
                (n_rows, n_cols)
            } else {
                (n_cols, n_rows)
            };
            let mut data = Vec::new();
            let mut indices: Vec<i64> = Vec::new();
            let mut indptr: Vec<i64> = Vec::with_capacity(n_major + 1);
            indptr.push(0);
            for major in 0..n_major {
                for minor in 0..n_minor {
                    let value = if row_major {
                        dense[[major, minor]]
                    } else {
                        dense[[minor, major]]
                    };
                    if value != 0.0 {
                        data.push(value);
                        indices.push(minor as i64);
                    }
                }
                indptr.push(data.len() as i64);
            }
            group.new_dataset_builder().with_data(&data).create("data")?;
            group
                .new_dataset_builder()
                .with_data(&indices)
                .create("indices")?;
            group
                .new_dataset_builder()
                .with_data(&indptr)
                .create("indptr")?;
        }
    }
    write_index_table(&file, "obs", cell_names)?;
    write_index_table(&file, "var", gene_names)?;
    Ok(())
}

fn write_index_table(file: &hdf5::File, table: &str, names: &[String]) -> Result<()> {
    let group = file.create_group(table)?;
    let index_name: VarLenUnicode = "_index".parse().expect("static string");
    group
        .new_attr_builder()
        .with_data(&[index_name])
        .create("_index")?;
    let encoded: Vec<VarLenUnicode> = names
        .iter()
        .map(|n| {
            n.parse().map_err(|_| {
                MapperError::MalformedMatrix(format!("{table} id {n:?} is not valid UTF-8"))
            })
        })
        .collect::<Result<_>>()?;
    group
        .new_dataset_builder()
        .with_data(&encoded)
        .create("_index")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_validate_indptr_rejects_non_monotone() {
        let err = validate_indptr(&[0, 4, 2, 5], 3, 5).unwrap_err();
        assert!(matches!(err, MapperError::MalformedMatrix(_)));
    }

    #[test]
    fn test_validate_indptr_rejects_bad_length() {
        assert!(validate_indptr(&[0, 1], 3, 1).is_err());
        assert!(validate_indptr(&[0, 1, 1, 1], 3, 2).is_err());
        assert!(validate_indptr(&[0, 1, 1, 2], 3, 2).is_ok());
    }

    #[test]
    fn test_anndata_round_trip_layouts() {
        let dense = array![
            [0.0, 1.5, 0.0, 2.0],
            [0.0, 0.0, 0.0, 0.0],
            [3.0, 0.0, 4.5, 0.0]
        ];
        let cells: Vec<String> = (0..3).map(|i| format!("cell_{i}")).collect();
        let genes: Vec<String> = (0..4).map(|i| format!("g_{i}")).collect();
        for layout in [MatrixLayout::Csr, MatrixLayout::Csc, MatrixLayout::Dense] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("matrix.h5ad");
            write_anndata(&path, &dense, layout, &cells, &genes).unwrap();

            let file = hdf5::File::open(&path).unwrap();
            let (found, n_rows, n_cols) = matrix_layout(&file).unwrap();
            assert_eq!(found, layout);
            assert_eq!((n_rows, n_cols), (3, 4));
            assert_eq!(read_index_column(&file, "obs").unwrap(), cells);
            assert_eq!(read_index_column(&file, "var").unwrap(), genes);
        }
    }

    #[test]
    fn test_load_csr_slab_matches_dense() {
        let dense = array![
            [0.0, 1.0, 0.0],
            [2.0, 0.0, 3.0],
            [0.0, 0.0, 0.0],
            [4.0, 5.0, 6.0]
        ];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.h5ad");
        let cells: Vec<String> = (0..4).map(|i| format!("c{i}")).collect();
        let genes: Vec<String> = (0..3).map(|i| format!("g{i}")).collect();
        write_anndata(&path, &dense, MatrixLayout::Csr, &cells, &genes).unwrap();

        let file = hdf5::File::open(&path).unwrap();
        let group = file.group("X").unwrap();
        let data = group.dataset("data").unwrap();
        let indices = group.dataset("indices").unwrap();
        let indptr: Vec<i64> = group.dataset("indptr").unwrap().read_raw().unwrap();
        validate_indptr(&indptr, 4, data.size()).unwrap();

        let slab = load_csr_slab(&data, &indices, &indptr, 1, 4, 3).unwrap();
        for r in 1..4 {
            for c in 0..3 {
                assert_eq!(slab[[r - 1, c]], dense[[r, c]]);
            }
        }
        let gathered = load_csr_rows(&data, &indices, &indptr, &[3, 0], 3).unwrap();
        assert_eq!(gathered.row(0).to_vec(), vec![4.0, 5.0, 6.0]);
        assert_eq!(gathered.row(1).to_vec(), vec![0.0, 1.0, 0.0]);
    }
}
