use ndarray::parallel::prelude::*;
use ndarray::prelude::*;

use crate::errors::{EnsembleError, Result};
use crate::grid::PatchGrid;

/// Cuts a raster into the patch stream expected by a predictor.
///
/// Patch `(r, c)` is the `patch_size` window whose top-left corner is
/// [`PatchGrid::patch_origin`]; pixels outside the raster are zero. Patches
/// come out in the grid's row-major order, so the stream can be fed to
/// [`crate::reconstruct::PredictionCollector`] without positional metadata.
pub struct PatchExtractor<'a> {
    raster: ArrayView3<'a, f32>,
    grid: PatchGrid,
}

impl<'a> PatchExtractor<'a> {
    pub fn new(raster: ArrayView3<'a, f32>, grid: PatchGrid) -> Result<Self> {
        let (h, w, c) = raster.dim();
        if (h, w) != (grid.height(), grid.width()) {
            return Err(EnsembleError::shape_mismatch(
                "raster extent",
                (grid.height(), grid.width()),
                (h, w),
            ));
        }
        if c == 0 {
            return Err(EnsembleError::configuration(
                "raster must have at least one channel",
            ));
        }
        Ok(Self { raster, grid })
    }

    pub const fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    pub fn channels(&self) -> usize {
        self.raster.dim().2
    }

    pub fn patch(&self, index: usize) -> Option<Array3<f32>> {
        let (row, col) = self.grid.position(index)?;
        let p = self.grid.geometry().patch_size();
        let mut out = Array3::<f32>::zeros((p, p, self.channels()));
        self.fill_patch(row, col, out.view_mut());
        Some(out)
    }

    /// Restartable iterator over `(B, P, P, C)` batches; only the last batch
    /// may be shorter than `batch_size`.
    pub fn batches(&self, batch_size: usize) -> PatchBatches<'_, 'a> {
        PatchBatches {
            extractor: self,
            batch_size: batch_size.max(1),
            next: 0,
        }
    }

    fn fill_batch(&self, start: usize, end: usize) -> Array4<f32> {
        let p = self.grid.geometry().patch_size();
        let mut batch = Array4::<f32>::zeros((end - start, p, p, self.channels()));
        batch
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(offset, patch)| {
                if let Some((row, col)) = self.grid.position(start + offset) {
                    self.fill_patch(row, col, patch);
                }
            });
        batch
    }

    // `out` must already be zeroed.
    fn fill_patch(&self, row: usize, col: usize, mut out: ArrayViewMut3<f32>) {
        let (oy, ox) = self.grid.patch_origin(row, col);
        let p = self.grid.geometry().patch_size() as isize;
        let (h, w, _) = self.raster.dim();

        let y0 = oy.max(0);
        let y1 = (oy + p).min(h as isize);
        let x0 = ox.max(0);
        let x1 = (ox + p).min(w as isize);
        if y0 >= y1 || x0 >= x1 {
            return;
        }

        let src = self.raster.slice(s![
            y0 as usize..y1 as usize,
            x0 as usize..x1 as usize,
            ..
        ]);
        out.slice_mut(s![
            (y0 - oy) as usize..(y1 - oy) as usize,
            (x0 - ox) as usize..(x1 - ox) as usize,
            ..
        ])
        .assign(&src);
    }
}

pub struct PatchBatches<'e, 'a> {
    extractor: &'e PatchExtractor<'a>,
    batch_size: usize,
    next: usize,
}

impl Iterator for PatchBatches<'_, '_> {
    type Item = Array4<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.extractor.grid.len();
        if self.next >= total {
            return None;
        }
        let start = self.next;
        let end = (start + self.batch_size).min(total);
        self.next = end;
        Some(self.extractor.fill_batch(start, end))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.extractor.grid.len().saturating_sub(self.next);
        let n = remaining.div_ceil(self.batch_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for PatchBatches<'_, '_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridGeometry;

    fn ramp(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 1), |(y, x, _)| (y * w + x + 1) as f32)
    }

    #[test]
    fn test_first_patch_is_zero_padded_top_left() -> Result<()> {
        let raster = ramp(6, 6);
        let grid = PatchGrid::new(6, 6, GridGeometry::new(4, 1, 1)?)?;
        let extractor = PatchExtractor::new(raster.view(), grid)?;

        let patch = extractor.patch(0).unwrap();
        assert_eq!(patch.slice(s![0, .., ..]).sum(), 0.0);
        assert_eq!(patch.slice(s![.., 0, ..]).sum(), 0.0);
        assert_eq!(patch[[1, 1, 0]], raster[[0, 0, 0]]);
        assert_eq!(patch[[3, 3, 0]], raster[[2, 2, 0]]);
        Ok(())
    }

    #[test]
    fn test_patch_centre_matches_output_region() -> Result<()> {
        let raster = ramp(10, 7);
        let grid = PatchGrid::new(10, 7, GridGeometry::new(5, 1, 1)?)?;
        let extractor = PatchExtractor::new(raster.view(), grid)?;

        for (index, (r, c)) in grid.positions().enumerate() {
            let patch = extractor.patch(index).unwrap();
            let (ys, xs) = grid.output_region(r, c);
            for (dy, y) in ys.enumerate() {
                for (dx, x) in xs.clone().enumerate() {
                    assert_eq!(patch[[1 + dy, 1 + dx, 0]], raster[[y, x, 0]]);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_batches_cover_grid_in_order() -> Result<()> {
        let raster = ramp(9, 9);
        let grid = PatchGrid::new(9, 9, GridGeometry::new(5, 1, 1)?)?;
        let extractor = PatchExtractor::new(raster.view(), grid)?;

        let batches = extractor.batches(4);
        assert_eq!(batches.len(), 3);

        let sizes: Vec<_> = extractor.batches(4).map(|b| b.dim().0).collect();
        assert_eq!(sizes, vec![4, 4, 1]);

        let last = extractor.batches(4).last().unwrap();
        assert_eq!(last.index_axis(Axis(0), 0), extractor.patch(8).unwrap());
        Ok(())
    }

    #[test]
    fn test_rejects_raster_not_matching_grid() -> Result<()> {
        let raster = ramp(9, 9);
        let grid = PatchGrid::new(8, 9, GridGeometry::new(5, 1, 1)?)?;
        assert!(matches!(
            PatchExtractor::new(raster.view(), grid),
            Err(EnsembleError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
