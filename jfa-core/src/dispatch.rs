//! Data-parallel kernel dispatch over 2D grids.
//!
//! A dispatch reads from one buffer and writes to a distinct one, so cells
//! never observe each other's results within a pass. Callers alternate
//! buffers between dispatches (see [`crate::PingPong`]).

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{JfaError, Result};

/// Width and height of a dispatch grid. Always non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridShape {
    pub width: u32,
    pub height: u32,
}

impl GridShape {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(JfaError::InvalidGrid {
                width: width as i64,
                height: height as i64,
            });
        }
        // the cell count must be addressable on this target
        if (width as usize).checked_mul(height as usize).is_none() {
            return Err(JfaError::InvalidGrid {
                width: width as i64,
                height: height as i64,
            });
        }
        Ok(Self { width, height })
    }

    /// Validate dimensions coming from an untyped surface (JS, YAML)
    pub fn from_signed(width: i64, height: i64) -> Result<Self> {
        let fits = |v: i64| v > 0 && v <= u32::MAX as i64;
        if !fits(width) || !fits(height) {
            return Err(JfaError::InvalidGrid { width, height });
        }
        Self::new(width as u32, height as u32)
    }

    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn max_side(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// `len` copies of `value`, or `ResourceExhaustion` when the host can't
/// provide them.
pub(crate) fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let requested = (len as u64).saturating_mul(std::mem::size_of::<T>() as u64);
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| JfaError::ResourceExhaustion { requested })?;
    buffer.resize(len, value);
    Ok(buffer)
}

/// The dispatch primitive both engines are written against.
pub trait Dispatch {
    /// Fill `dst` row by row: `kernel(row_index, row)` owns exactly one row
    /// of `row_len` entries and nothing else.
    fn run_rows<T, K>(&self, dst: &mut [T], row_len: usize, kernel: K) -> Result<()>
    where
        T: Send,
        K: Fn(usize, &mut [T]) + Send + Sync;

    /// Evaluate `kernel(x, y, src)` for every cell of `shape` and store the
    /// value in the matching slot of `dst`.
    fn run_kernel<T, K>(&self, shape: GridShape, src: &[T], dst: &mut [T], kernel: K) -> Result<()>
    where
        T: Send + Sync,
        K: Fn(u32, u32, &[T]) -> T + Send + Sync,
    {
        if dst.len() != shape.len() {
            return Err(JfaError::InvalidInput(format!(
                "output buffer holds {} entries, grid {}x{} needs {}",
                dst.len(),
                shape.width,
                shape.height,
                shape.len(),
            )));
        }
        self.run_rows(dst, shape.width as usize, |y, row| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel(x as u32, y as u32, src);
            }
        })
    }
}

/// CPU dispatcher: Rayon row parallelism, or a plain loop.
#[derive(Debug, Clone, Copy)]
pub struct CpuDispatch {
    parallel: bool,
}

impl CpuDispatch {
    /// Parallel when the `parallel` feature is compiled in
    pub fn new() -> Self {
        Self { parallel: cfg!(feature = "parallel") }
    }

    pub fn serial() -> Self {
        Self { parallel: false }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }
}

impl Default for CpuDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch for CpuDispatch {
    fn run_rows<T, K>(&self, dst: &mut [T], row_len: usize, kernel: K) -> Result<()>
    where
        T: Send,
        K: Fn(usize, &mut [T]) + Send + Sync,
    {
        if row_len == 0 || dst.len() % row_len != 0 {
            return Err(JfaError::InvalidInput(format!(
                "buffer of {} entries is not a whole number of {}-entry rows",
                dst.len(),
                row_len,
            )));
        }

        #[cfg(feature = "parallel")]
        {
            if self.parallel {
                dst.par_chunks_mut(row_len)
                    .enumerate()
                    .for_each(|(y, row)| kernel(y, row));
                return Ok(());
            }
        }

        for (y, row) in dst.chunks_mut(row_len).enumerate() {
            kernel(y, row);
        }
        Ok(())
    }
}
