use ndarray::parallel::prelude::*;
use ndarray::prelude::*;

use crate::errors::{EnsembleError, Result};
use crate::grid::PatchGrid;

/// Ordered patch predictions of one replica, tagged with the grid they cover.
///
/// Holds exactly `grid.len()` patches of shape `(P, P, C)` in row-major
/// order. The only ways to obtain one are [`PredictionCollector::finish`] and
/// [`PatchPredictions::from_array`], both of which validate cardinality and
/// per-patch shape.
#[derive(Debug, Clone)]
pub struct PatchPredictions {
    grid: PatchGrid,
    patches: Array4<f32>,
}

impl PatchPredictions {
    pub fn from_array(grid: PatchGrid, patches: Array4<f32>) -> Result<Self> {
        let (n, p0, p1, c) = patches.dim();
        if n != grid.len() {
            return Err(EnsembleError::shape_mismatch("patch count", grid.len(), n));
        }
        if [p0, p1, c] != grid.geometry().patch_shape() {
            return Err(EnsembleError::shape_mismatch(
                "patch prediction shape",
                grid.geometry().patch_shape(),
                [p0, p1, c],
            ));
        }
        let patches = if patches.is_standard_layout() {
            patches
        } else {
            patches.as_standard_layout().into_owned()
        };
        Ok(Self { grid, patches })
    }

    pub const fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    pub fn patches(&self) -> ArrayView4<'_, f32> {
        self.patches.view()
    }

    /// The flat sequence viewed as `(rows, cols, P, P, C)`.
    pub fn grid_view(&self) -> ArrayView<'_, f32, Ix5> {
        let [p, _, c] = self.grid.geometry().patch_shape();
        // Cannot fail: the layout is standard and the length was checked.
        self.patches
            .view()
            .into_shape_with_order((self.grid.rows(), self.grid.cols(), p, p, c))
            .expect("validated patch stack reshapes to the grid")
    }
}

/// 推論バッチを順番に受け取り、グリッド 1 枚分の予測列を組み立てる
///
/// 予測器は順序を保つことだけが契約なので、ここで個数と形状を検査する
#[derive(Debug)]
pub struct PredictionCollector {
    grid: PatchGrid,
    data: Vec<f32>,
    received: usize,
}

impl PredictionCollector {
    pub fn new(grid: PatchGrid) -> Self {
        let [p, _, c] = grid.geometry().patch_shape();
        Self {
            grid,
            data: Vec::with_capacity(grid.len() * p * p * c),
            received: 0,
        }
    }

    pub const fn received(&self) -> usize {
        self.received
    }

    pub const fn expected(&self) -> usize {
        self.grid.len()
    }

    pub fn push_batch(&mut self, batch: ArrayView4<f32>) -> Result<()> {
        let (b, p0, p1, c) = batch.dim();
        if [p0, p1, c] != self.grid.geometry().patch_shape() {
            return Err(EnsembleError::shape_mismatch(
                format!("patch prediction shape (batch at patch {})", self.received),
                self.grid.geometry().patch_shape(),
                [p0, p1, c],
            ));
        }
        if self.received + b > self.grid.len() {
            return Err(EnsembleError::shape_mismatch(
                "patch count",
                self.grid.len(),
                self.received + b,
            ));
        }
        self.data.extend(batch.iter().copied());
        self.received += b;
        Ok(())
    }

    pub fn finish(self) -> Result<PatchPredictions> {
        if self.received != self.grid.len() {
            return Err(EnsembleError::shape_mismatch(
                "patch count",
                self.grid.len(),
                self.received,
            ));
        }
        let [p, _, c] = self.grid.geometry().patch_shape();
        let patches = Array4::from_shape_vec((self.received, p, p, c), self.data)?;
        Ok(PatchPredictions {
            grid: self.grid,
            patches,
        })
    }
}

/// Crops every patch by `test_crop` on all four sides and stitches the
/// centres into one raster trimmed to the original `(H, W)`.
///
/// Each cropped centre is written straight into its destination region, which
/// gives the same result as concatenating each grid row horizontally, the
/// strips vertically, and then cutting the bottom/right overshoot. Every
/// output pixel comes from exactly one patch.
pub fn reconstruct(predictions: &PatchPredictions) -> Array3<f32> {
    let grid = *predictions.grid();
    let crop = grid.geometry().test_crop();
    let inner = grid.geometry().inner();
    let cells = predictions.grid_view();

    let mut raster = Array3::<f32>::zeros(grid.raster_shape());
    raster
        .axis_chunks_iter_mut(Axis(0), inner)
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut strip)| {
            for col in 0..grid.cols() {
                let (ys, xs) = grid.output_region(row, col);
                let block = cells.slice(s![
                    row,
                    col,
                    crop..crop + ys.len(),
                    crop..crop + xs.len(),
                    ..
                ]);
                strip.slice_mut(s![.., xs, ..]).assign(&block);
            }
        });
    raster
}
