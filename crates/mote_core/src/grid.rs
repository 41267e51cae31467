//! Uniform bin grid over the world rectangle
//!
//! The world is centered on the origin. Bins tile it exactly: each axis gets
//! `max(1, floor(extent / MAX_FORCE_RADIUS))` bins, so a bin is never
//! narrower than the largest interaction radius and the 3x3 neighborhood
//! always covers every partner in range.

use smallvec::SmallVec;

use crate::generation::MAX_FORCE_RADIUS;

/// Neighbor bins along one axis, at most three
pub type CellRange = SmallVec<[u32; 3]>;

/// Bin grid derived from the world size
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridLayout {
    pub width: f32,
    pub height: f32,
    pub grid_width: u32,
    pub grid_height: u32,
    pub bin_size_x: f32,
    pub bin_size_y: f32,
}

impl GridLayout {
    /// Grid for a `width x height` world; dimensions must be positive
    pub fn new(width: f32, height: f32) -> Self {
        let grid_width = axis_bins(width);
        let grid_height = axis_bins(height);
        Self {
            width,
            height,
            grid_width,
            grid_height,
            bin_size_x: width / grid_width as f32,
            bin_size_y: height / grid_height as f32,
        }
    }

    pub fn left(&self) -> f32 {
        -0.5 * self.width
    }

    pub fn right(&self) -> f32 {
        0.5 * self.width
    }

    pub fn bottom(&self) -> f32 {
        -0.5 * self.height
    }

    pub fn top(&self) -> f32 {
        0.5 * self.height
    }

    pub fn bin_count(&self) -> u32 {
        self.grid_width * self.grid_height
    }

    /// Bin column and row of a position, clamped into the grid
    pub fn bin_coords(&self, x: f32, y: f32) -> (u32, u32) {
        (
            clamp_cell((x - self.left()) / self.bin_size_x, self.grid_width),
            clamp_cell((y - self.bottom()) / self.bin_size_y, self.grid_height),
        )
    }

    /// Flat bin index of a position
    pub fn bin_index(&self, x: f32, y: f32) -> u32 {
        let (bx, by) = self.bin_coords(x, y);
        by * self.grid_width + bx
    }
}

/// Bins along one axis that can hold a partner of a particle in bin `cell`
///
/// Wrapping grids narrower than three bins list every bin once so no
/// partner is visited twice.
pub fn neighbor_cells(cell: u32, dim: u32, wrap: bool) -> CellRange {
    let mut cells = CellRange::new();
    if wrap {
        if dim >= 3 {
            cells.push((cell + dim - 1) % dim);
            cells.push(cell);
            cells.push((cell + 1) % dim);
        } else {
            cells.extend(0..dim);
        }
        return cells;
    }
    if cell > 0 {
        cells.push(cell - 1);
    }
    cells.push(cell);
    if cell + 1 < dim {
        cells.push(cell + 1);
    }
    cells
}

/// Number of Hillis-Steele passes over `bin_count + 1` offsets
///
/// Rounded up to an even count so the ping-pong ends in the buffer it
/// started from.
pub fn prefix_passes(bin_count: u32) -> u32 {
    let passes = ceil_log2(bin_count);
    passes + (passes & 1)
}

/// Step size of prefix pass `pass`
pub fn prefix_step(pass: u32) -> u32 {
    1 << pass
}

fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

fn axis_bins(extent: f32) -> u32 {
    ((extent / MAX_FORCE_RADIUS).floor() as u32).max(1)
}

fn clamp_cell(scaled: f32, dim: u32) -> u32 {
    // `as` saturates and maps NaN to zero, matching the kernels' conversion
    (scaled.floor() as i64).clamp(0, dim as i64 - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_tiles_world() {
        let grid = GridLayout::new(256.0, 100.0);
        assert_eq!(grid.grid_width, 8);
        assert_eq!(grid.grid_height, 3);
        assert_eq!(grid.bin_size_x, 32.0);
        assert!(grid.bin_size_y >= MAX_FORCE_RADIUS);
        assert_eq!(grid.bin_size_x * grid.grid_width as f32, grid.width);
    }

    #[test]
    fn test_tiny_world_has_one_bin() {
        let grid = GridLayout::new(10.0, 10.0);
        assert_eq!(grid.bin_count(), 1);
        assert_eq!(grid.bin_index(4.0, -4.0), 0);
    }

    #[test]
    fn test_boundary_positions_stay_in_grid() {
        let grid = GridLayout::new(256.0, 256.0);
        assert_eq!(grid.bin_coords(grid.left(), grid.bottom()), (0, 0));
        assert_eq!(grid.bin_coords(grid.right(), grid.top()), (7, 7));
        assert_eq!(grid.bin_coords(1e9, -1e9), (7, 0));
        assert_eq!(grid.bin_coords(f32::NAN, 0.0).0, 0);
    }

    #[test]
    fn test_neighbor_cells_wrap() {
        assert_eq!(neighbor_cells(0, 8, true).as_slice(), &[7, 0, 1]);
        assert_eq!(neighbor_cells(7, 8, true).as_slice(), &[6, 7, 0]);
        assert_eq!(neighbor_cells(1, 2, true).as_slice(), &[0, 1]);
        assert_eq!(neighbor_cells(0, 1, true).as_slice(), &[0]);
    }

    #[test]
    fn test_neighbor_cells_clamped() {
        assert_eq!(neighbor_cells(0, 8, false).as_slice(), &[0, 1]);
        assert_eq!(neighbor_cells(7, 8, false).as_slice(), &[6, 7]);
        assert_eq!(neighbor_cells(3, 8, false).as_slice(), &[2, 3, 4]);
        assert_eq!(neighbor_cells(0, 1, false).as_slice(), &[0]);
    }

    #[test]
    fn test_prefix_passes_are_even() {
        assert_eq!(prefix_passes(1), 0);
        assert_eq!(prefix_passes(2), 2);
        assert_eq!(prefix_passes(4), 2);
        assert_eq!(prefix_passes(5), 4);
        assert_eq!(prefix_passes(64), 6);
        assert_eq!(prefix_passes(65), 8);
        for bins in 1..2000 {
            let passes = prefix_passes(bins);
            assert_eq!(passes % 2, 0);
            // Total reach of all steps must cover every offset
            assert!(1u64 << passes >= bins as u64);
        }
    }
}
