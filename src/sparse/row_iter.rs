use std::path::Path;

use ndarray::{Array2, s};
use tempfile::TempDir;

use crate::error::{MapperError, Result};
use crate::sparse::transpose::csc_to_csr_on_disk;
use crate::sparse::{MatrixLayout, load_csr_slab, matrix_layout, validate_indptr};

/// One dense slab of rows `[r0, r1)` from a cell by gene matrix.
#[derive(Debug)]
pub struct RowChunk {
    pub data: Array2<f64>,
    pub r0: usize,
    pub r1: usize,
}

#[derive(Debug)]
struct CsrSource {
    data: hdf5::Dataset,
    indices: hdf5::Dataset,
    indptr: Vec<i64>,
}

#[derive(Debug)]
struct CscSource {
    data: hdf5::Dataset,
    indices: hdf5::Dataset,
    indptr: Vec<i64>,
    budget: usize,
}

#[derive(Debug)]
enum Source {
    Csr(CsrSource),
    Dense(hdf5::Dataset),
    CscStride(CscSource),
}

/// Streams the rows of an h5ad `X` matrix in order as dense chunks,
/// regardless of the on-disk layout. CSR is read directly; dense is
/// sliced; CSC is transcribed to a scratch CSR file when a scratch
/// directory is available, and otherwise read with a column-striding
/// fallback that rescans the column blocks for every chunk.
#[derive(Debug)]
pub struct AnnDataRowIterator {
    source: Source,
    chunk_size: usize,
    n_rows: usize,
    n_cols: usize,
    next_row: usize,
    _file: hdf5::File,
    _scratch: Option<(TempDir, hdf5::File)>,
}

impl AnnDataRowIterator {
    pub fn new(
        h5ad_path: &Path,
        chunk_size: usize,
        scratch_dir: Option<&Path>,
        max_gb: f64,
    ) -> Result<Self> {
        if !h5ad_path.is_file() {
            return Err(MapperError::MissingInput(h5ad_path.to_path_buf()));
        }
        if chunk_size == 0 {
            return Err(MapperError::Config("chunk_size must be positive".into()));
        }
        let file = hdf5::File::open(h5ad_path)?;
        let (layout, n_rows, n_cols) = matrix_layout(&file)?;

        let mut scratch = None;
        let source = match layout {
            MatrixLayout::Dense => Source::Dense(file.dataset("X")?),
            MatrixLayout::Csr => {
                let group = file.group("X")?;
                let data = group.dataset("data")?;
                let indices = group.dataset("indices")?;
                let indptr: Vec<i64> = group.dataset("indptr")?.read_raw()?;
                validate_indptr(&indptr, n_rows, data.size())?;
                Source::Csr(CsrSource {
                    data,
                    indices,
                    indptr,
                })
            }
            MatrixLayout::Csc => {
                let group = file.group("X")?;
                match scratch_dir {
                    Some(dir) => {
                        let tmp = tempfile::Builder::new()
                            .prefix("as_csr_")
                            .tempdir_in(dir)?;
                        let csr_path = tmp.path().join("transposed.h5");
                        tracing::info!(
                            "transcribing CSC matrix {} to scratch CSR file",
                            h5ad_path.display()
                        );
                        csc_to_csr_on_disk(&group, &csr_path, n_rows, max_gb)?;
                        let csr = hdf5::File::open(&csr_path)?;
                        let data = csr.dataset("data")?;
                        let indices = csr.dataset("indices")?;
                        let indptr: Vec<i64> = csr.dataset("indptr")?.read_raw()?;
                        validate_indptr(&indptr, n_rows, data.size())?;
                        let source = Source::Csr(CsrSource {
                            data,
                            indices,
                            indptr,
                        });
                        scratch = Some((tmp, csr));
                        source
                    }
                    None => {
                        let data = group.dataset("data")?;
                        let indices = group.dataset("indices")?;
                        let indptr: Vec<i64> = group.dataset("indptr")?.read_raw()?;
                        validate_indptr(&indptr, n_cols, data.size())?;
                        let budget = ((max_gb * 1.0e9 / 8.0) as usize).max(1);
                        Source::CscStride(CscSource {
                            data,
                            indices,
                            indptr,
                            budget,
                        })
                    }
                }
            }
        };

        Ok(Self {
            source,
            chunk_size,
            n_rows,
            n_cols,
            next_row: 0,
            _file: file,
            _scratch: scratch,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    fn load_chunk(&self, r0: usize, r1: usize) -> Result<Array2<f64>> {
        match &self.source {
            Source::Csr(src) => {
                load_csr_slab(&src.data, &src.indices, &src.indptr, r0, r1, self.n_cols)
            }
            Source::Dense(ds) => Ok(ds.read_slice_2d::<f64, _>(s![r0..r1, ..])?),
            Source::CscStride(src) => self.load_csc_stride(src, r0, r1),
        }
    }

    fn load_csc_stride(&self, src: &CscSource, r0: usize, r1: usize) -> Result<Array2<f64>> {
        let mut out = Array2::<f64>::zeros((r1 - r0, self.n_cols));
        let mut c0 = 0usize;
        while c0 < self.n_cols {
            let mut c1 = c0 + 1;
            while c1 < self.n_cols
                && (src.indptr[c1 + 1] - src.indptr[c0]) as usize <= src.budget
            {
                c1 += 1;
            }
            let s0 = src.indptr[c0] as usize;
            let s1 = src.indptr[c1] as usize;
            if s0 == s1 {
                c0 = c1;
                continue;
            }
            let rows = src.indices.read_slice_1d::<i64, _>(s![s0..s1])?;
            let values = src.data.read_slice_1d::<f64, _>(s![s0..s1])?;
            for col in c0..c1 {
                let a = src.indptr[col] as usize - s0;
                let b = src.indptr[col + 1] as usize - s0;
                for k in a..b {
                    let row = rows[k] as usize;
                    if row >= self.n_rows {
                        return Err(MapperError::MalformedMatrix(format!(
                            "row index {row} out of range for {} rows",
                            self.n_rows
                        )));
                    }
                    if row >= r0 && row < r1 {
                        out[[row - r0, col]] = values[k];
                    }
                }
            }
            c0 = c1;
        }
        Ok(out)
    }
}

impl Iterator for AnnDataRowIterator {
    type Item = Result<RowChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row >= self.n_rows {
            return None;
        }
        let r0 = self.next_row;
        let r1 = (r0 + self.chunk_size).min(self.n_rows);
        self.next_row = r1;
        Some(self.load_chunk(r0, r1).map(|data| RowChunk { data, r0, r1 }))
    }
}
