use std::ops::Range;

use crate::errors::{EnsembleError, Result};

/// パッチ形状とクロップ幅の組
///
/// 構築時に `patch_size > 2 * test_crop` を検証するため、
/// 以降の処理ではクロップ後の有効領域が必ず 1 ピクセル以上残る
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    patch_size: usize,
    test_crop: usize,
    n_classes: usize,
}

impl GridGeometry {
    pub fn new(patch_size: usize, test_crop: usize, n_classes: usize) -> Result<Self> {
        if patch_size == 0 {
            return Err(EnsembleError::configuration("patch_size must be positive"));
        }
        if n_classes == 0 {
            return Err(EnsembleError::configuration("n_classes must be positive"));
        }
        if patch_size <= 2 * test_crop {
            return Err(EnsembleError::configuration(format!(
                "patch_size {} leaves no pixels after cropping {} from each side",
                patch_size, test_crop
            )));
        }
        Ok(Self {
            patch_size,
            test_crop,
            n_classes,
        })
    }

    pub const fn patch_size(&self) -> usize {
        self.patch_size
    }

    pub const fn test_crop(&self) -> usize {
        self.test_crop
    }

    pub const fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// クロップ後に残る一辺の長さ（= パッチ間のストライド）
    pub const fn inner(&self) -> usize {
        self.patch_size - 2 * self.test_crop
    }

    /// 1 パッチ分の予測テンソル形状 (P, P, C)
    pub const fn patch_shape(&self) -> [usize; 3] {
        [self.patch_size, self.patch_size, self.n_classes]
    }
}

/// ラスタを覆うパッチグリッド
///
/// パッチは行優先（行 0 を左から右、次に行 1 …）で並ぶ。
/// 再構成側は位置情報を持たず順序のみに依存するため、
/// パッチ生成と再構成の双方がこの型の `positions()` を共有する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    height: usize,
    width: usize,
    rows: usize,
    cols: usize,
    geometry: GridGeometry,
}

impl PatchGrid {
    pub fn new(height: usize, width: usize, geometry: GridGeometry) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(EnsembleError::configuration(format!(
                "raster dimensions must be positive, got {}x{}",
                height, width
            )));
        }
        let inner = geometry.inner();
        Ok(Self {
            height,
            width,
            rows: height.div_ceil(inner),
            cols: width.div_ceil(inner),
            geometry,
        })
    }

    pub const fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub const fn height(&self) -> usize {
        self.height
    }

    pub const fn width(&self) -> usize {
        self.width
    }

    pub const fn rows(&self) -> usize {
        self.rows
    }

    pub const fn cols(&self) -> usize {
        self.cols
    }

    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 再構成後（トリム済み）のラスタ形状 (H, W, C)
    pub const fn raster_shape(&self) -> [usize; 3] {
        [self.height, self.width, self.geometry.n_classes()]
    }

    /// Row-major sequence of `(row, col)` cells.
    pub fn positions(&self) -> impl ExactSizeIterator<Item = (usize, usize)> {
        let cols = self.cols;
        (0..self.len()).map(move |i| (i / cols, i % cols))
    }

    pub fn position(&self, index: usize) -> Option<(usize, usize)> {
        (index < self.len()).then(|| (index / self.cols, index % self.cols))
    }

    /// Top-left corner of the input window read for patch `(row, col)`.
    ///
    /// Negative coordinates fall into the zero padding above/left of the raster.
    pub fn patch_origin(&self, row: usize, col: usize) -> (isize, isize) {
        let inner = self.geometry.inner() as isize;
        let crop = self.geometry.test_crop() as isize;
        (row as isize * inner - crop, col as isize * inner - crop)
    }

    /// Output rows/cols covered by the cropped centre of patch `(row, col)`,
    /// clipped to the raster. The last row/column of the grid may cover
    /// fewer than `inner` pixels.
    pub fn output_region(&self, row: usize, col: usize) -> (Range<usize>, Range<usize>) {
        let inner = self.geometry.inner();
        let y0 = row * inner;
        let x0 = col * inner;
        (
            y0..(y0 + inner).min(self.height),
            x0..(x0 + inner).min(self.width),
        )
    }
}
