use std::path::Path;

use ndarray::s;

use crate::error::{MapperError, Result};
use crate::sparse::validate_indptr;

const BYTES_PER_ELEMENT: f64 = 8.0;

/// Transpose a compressed sparse matrix on disk: the source is
/// compressed along its major axis (`indptr` over majors, `indices`
/// holding minor ids); the output file gets top-level `indptr` (over
/// minors), `indices` (holding major ids) and, when `data` is given,
/// the reordered values. Within each output row the entries arrive in
/// ascending major order, so the output has sorted indices.
///
/// Memory is bounded by `max_gb`: a two-pass streaming bucket sort.
/// Pass 1 histograms `indices` into the output `indptr`; pass 2 fills
/// one output-row window at a time, streaming the source in
/// major-groups that fit the budget, and writes each window
/// sequentially.
pub fn transpose_sparse_on_disk(
    data: Option<&hdf5::Dataset>,
    indices: &hdf5::Dataset,
    src_indptr: &[i64],
    n_minor: usize,
    dst: &hdf5::Group,
    max_gb: f64,
) -> Result<()> {
    let n_major = src_indptr.len() - 1;
    let nnz = indices.size();
    validate_indptr(src_indptr, n_major, nnz)?;

    // Half the budget for the window buckets, half for streamed chunks.
    let budget = ((max_gb * 1.0e9 / BYTES_PER_ELEMENT / 2.0) as usize).max(1);

    // Pass 1: histogram minor ids into the output indptr.
    let mut counts = vec![0i64; n_minor];
    let mut i0 = 0usize;
    while i0 < nnz {
        let i1 = (i0 + budget).min(nnz);
        let chunk = indices.read_slice_1d::<i64, _>(s![i0..i1])?;
        for &minor in chunk.iter() {
            if minor < 0 || minor as usize >= n_minor {
                return Err(MapperError::MalformedMatrix(format!(
                    "index {minor} out of range for minor extent {n_minor}"
                )));
            }
            counts[minor as usize] += 1;
        }
        i0 = i1;
    }
    let mut out_indptr = vec![0i64; n_minor + 1];
    for minor in 0..n_minor {
        out_indptr[minor + 1] = out_indptr[minor] + counts[minor];
    }

    dst.new_dataset_builder()
        .with_data(&out_indptr)
        .create("indptr")?;
    let out_indices = dst.new_dataset::<i64>().shape(nnz).create("indices")?;
    let out_data = match data {
        Some(_) => Some(dst.new_dataset::<f64>().shape(nnz).create("data")?),
        None => None,
    };

    // Pass 2: fill output-row windows whose nnz fits the budget.
    let mut w0 = 0usize;
    while w0 < n_minor {
        let base = out_indptr[w0] as usize;
        let mut w1 = w0 + 1;
        while w1 < n_minor && (out_indptr[w1 + 1] as usize - base) <= budget {
            w1 += 1;
        }
        let window_nnz = out_indptr[w1] as usize - base;
        if window_nnz == 0 {
            w0 = w1;
            continue;
        }

        let mut bucket_indices = vec![0i64; window_nnz];
        let mut bucket_data = data.map(|_| vec![0f64; window_nnz]);
        let mut cursor: Vec<usize> = (w0..w1)
            .map(|minor| out_indptr[minor] as usize - base)
            .collect();

        // Stream the source in major-groups bounded by the budget; a
        // single oversized major still goes through in one group.
        let mut g0 = 0usize;
        while g0 < n_major {
            let mut g1 = g0 + 1;
            while g1 < n_major
                && (src_indptr[g1 + 1] - src_indptr[g0]) as usize <= budget
            {
                g1 += 1;
            }
            let s0 = src_indptr[g0] as usize;
            let s1 = src_indptr[g1] as usize;
            if s0 == s1 {
                g0 = g1;
                continue;
            }
            let minor_chunk = indices.read_slice_1d::<i64, _>(s![s0..s1])?;
            let data_chunk = match data {
                Some(ds) => Some(ds.read_slice_1d::<f64, _>(s![s0..s1])?),
                None => None,
            };
            for major in g0..g1 {
                let a = src_indptr[major] as usize - s0;
                let b = src_indptr[major + 1] as usize - s0;
                for k in a..b {
                    let minor = minor_chunk[k] as usize;
                    if minor < w0 || minor >= w1 {
                        continue;
                    }
                    let pos = cursor[minor - w0];
                    cursor[minor - w0] += 1;
                    bucket_indices[pos] = major as i64;
                    if let (Some(values), Some(chunk)) = (&mut bucket_data, &data_chunk) {
                        values[pos] = chunk[k];
                    }
                }
            }
            g0 = g1;
        }

        out_indices.write_slice(&bucket_indices[..], s![base..base + window_nnz])?;
        if let (Some(ds), Some(values)) = (&out_data, &bucket_data) {
            ds.write_slice(&values[..], s![base..base + window_nnz])?;
        }
        w0 = w1;
    }
    Ok(())
}

/// Transcribe the CSC `X` group of an h5ad file into a standalone CSR
/// file (top-level `data`/`indices`/`indptr`) for fast row iteration.
pub fn csc_to_csr_on_disk(
    csc_group: &hdf5::Group,
    csr_path: &Path,
    n_rows: usize,
    max_gb: f64,
) -> Result<()> {
    let data = csc_group.dataset("data")?;
    let indices = csc_group.dataset("indices")?;
    let src_indptr: Vec<i64> = csc_group.dataset("indptr")?.read_raw()?;
    let dst = hdf5::File::create(csr_path)?;
    transpose_sparse_on_disk(Some(&data), &indices, &src_indptr, n_rows, &dst, max_gb)
}
