//! Lloyd relaxation step via hierarchical parallel reduction.
//!
//! The grid is cut into `4 * patches_per_line²` patches (each quadrant holds
//! `patches_per_line²` of them). Level 0 holds one [`Accum`] per (patch,
//! site); every further level sums pairs of rows from the previous level
//! through a ping-pong pyramid until one row, one aggregate per site, is
//! left.

use log::{debug, warn};

use crate::dispatch::{CpuDispatch, Dispatch, GridShape};
use crate::jfa::{AssignmentGrid, PingPong};
use crate::site::{Color, Position, Site};
use crate::{JfaError, Result};

/// Patch layout of the reduction pyramid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionConfig {
    /// Patches along one side of a grid quadrant
    pub patches_per_line: u32,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self { patches_per_line: 3 }
    }
}

impl ReductionConfig {
    /// Patches along one side of the whole grid
    pub fn patches_per_axis(&self) -> Result<u32> {
        self.patches_per_line
            .checked_mul(2)
            .filter(|&axis| axis > 0)
            .ok_or_else(|| {
                JfaError::InvalidInput(format!(
                    "patches_per_line must be in 1..={}, got {}",
                    u32::MAX / 2,
                    self.patches_per_line
                ))
            })
    }

    pub fn patch_count(&self) -> Result<usize> {
        let axis = self.patches_per_axis()?;
        let count = axis.checked_mul(axis).ok_or_else(|| {
            JfaError::InvalidInput(format!("{}x{} patches overflow the pyramid", axis, axis))
        })?;
        Ok(count as usize)
    }

    /// Levels including level 0: `ceil(log2(patch_count)) + 1`
    pub fn level_count(&self) -> Result<usize> {
        let mut rows = self.patch_count()?;
        let mut levels = 1;
        while rows > 1 {
            rows = rows.div_ceil(2);
            levels += 1;
        }
        Ok(levels)
    }
}

/// Per-site partial sums. Positions and colors sum in `f64` so large cells
/// don't bias the centroid.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Accum {
    pub sum_x: f64,
    pub sum_y: f64,
    pub sum_color: [f64; 3],
    pub count: u32,
}

impl Accum {
    pub const ZERO: Accum = Accum {
        sum_x: 0.0,
        sum_y: 0.0,
        sum_color: [0.0; 3],
        count: 0,
    };

    #[inline]
    fn add_cell(&mut self, pos: Position, color: Color) {
        self.sum_x += pos.x as f64;
        self.sum_y += pos.y as f64;
        self.sum_color[0] += color.r as f64;
        self.sum_color[1] += color.g as f64;
        self.sum_color[2] += color.b as f64;
        self.count += 1;
    }

    pub fn merge(self, other: Accum) -> Accum {
        Accum {
            sum_x: self.sum_x + other.sum_x,
            sum_y: self.sum_y + other.sum_y,
            sum_color: [
                self.sum_color[0] + other.sum_color[0],
                self.sum_color[1] + other.sum_color[1],
                self.sum_color[2] + other.sum_color[2],
            ],
            count: self.count + other.count,
        }
    }

    pub fn centroid(&self) -> Option<Position> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(Position::new((self.sum_x / n) as f32, (self.sum_y / n) as f32))
    }

    pub fn mean_color(&self) -> Option<Color> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(Color::new(
            (self.sum_color[0] / n) as f32,
            (self.sum_color[1] / n) as f32,
            (self.sum_color[2] / n) as f32,
        ))
    }
}

/// Outcome of one Lloyd step
#[derive(Debug, Clone, PartialEq)]
pub struct Relaxation {
    /// Sites moved to their cell centroids (unchanged where a site owns no cell)
    pub sites: Vec<Site>,
    /// Cells owned per site
    pub areas: Vec<u32>,
    /// Sum of per-site moves, normalized units
    pub total_displacement: f64,
    pub max_displacement: f64,
    /// Pyramid levels evaluated, level 0 included
    pub levels: usize,
}

impl Relaxation {
    fn empty() -> Self {
        Self {
            sites: Vec::new(),
            areas: Vec::new(),
            total_displacement: 0.0,
            max_displacement: 0.0,
            levels: 0,
        }
    }

    /// Sites that currently claim no cell
    pub fn degenerate_sites(&self) -> usize {
        self.areas.iter().filter(|&&a| a == 0).count()
    }
}

/// Centroid reduction over an [`AssignmentGrid`].
#[derive(Debug, Clone, Default)]
pub struct ReductionEngine<D = CpuDispatch> {
    dispatch: D,
    config: ReductionConfig,
}

impl<D: Dispatch> ReductionEngine<D> {
    pub fn new(dispatch: D) -> Self {
        Self::with_config(dispatch, ReductionConfig::default())
    }

    pub fn with_config(dispatch: D, config: ReductionConfig) -> Self {
        Self { dispatch, config }
    }

    pub fn config(&self) -> ReductionConfig {
        self.config
    }

    /// One Lloyd step; site colors are carried through unchanged.
    pub fn relax(&self, grid: &AssignmentGrid, sites: &[Site]) -> Result<Relaxation> {
        self.reduce(grid, sites, |_, _, site| site.color)
    }

    /// One Lloyd step that also recolors every site with the mean of
    /// `image` over its cell. `image` must match the grid's size.
    pub fn relax_sampled(
        &self,
        grid: &AssignmentGrid,
        sites: &[Site],
        image: &image::RgbImage,
    ) -> Result<Relaxation> {
        if image.dimensions() != (grid.width(), grid.height()) {
            return Err(JfaError::InvalidInput(format!(
                "image is {}x{}, grid is {}x{}",
                image.width(),
                image.height(),
                grid.width(),
                grid.height(),
            )));
        }
        self.reduce(grid, sites, |x, y, _| Color::from_rgb8(image.get_pixel(x, y).0))
    }

    fn reduce<C>(&self, grid: &AssignmentGrid, sites: &[Site], cell_color: C) -> Result<Relaxation>
    where
        C: Fn(u32, u32, &Site) -> Color + Sync,
    {
        let patch_count = self.config.patch_count()?;
        let axis = self.config.patches_per_axis()?;
        if sites.is_empty() {
            return Ok(Relaxation::empty());
        }
        if let Some(stray) = grid
            .claims()
            .iter()
            .find(|c| c.is_valid() && c.site as usize >= sites.len())
        {
            return Err(JfaError::InvalidInput(format!(
                "grid claims site {} but only {} sites were given",
                stray.site,
                sites.len(),
            )));
        }

        let site_count = sites.len();
        let level_width = u32::try_from(site_count).map_err(|_| {
            JfaError::InvalidInput(format!("{} sites exceed the reduction width", site_count))
        })?;
        let entries = patch_count
            .checked_mul(site_count)
            .ok_or(JfaError::ResourceExhaustion { requested: u64::MAX })?;
        let mut pyramid = PingPong::filled(entries, Accum::ZERO)?;

        // level 0: each invocation owns one patch row of `site_count` entries
        let shape = grid.shape();
        self.dispatch
            .run_rows(pyramid.current_mut(), site_count, |patch, row| {
                let (xs, ys) = patch_bounds(shape, axis, patch as u32);
                for y in ys {
                    for x in xs.clone() {
                        if let Some(id) = grid.site_at(x, y) {
                            let id = id as usize;
                            let color = cell_color(x, y, &sites[id]);
                            row[id].add_cell(grid.cell_center(x, y), color);
                        }
                    }
                }
            })?;

        let mut rows = patch_count;
        let mut levels = 1;
        while rows > 1 {
            let next_rows = rows.div_ceil(2);
            let level_shape = GridShape::new(level_width, next_rows as u32)?;
            let (current, next) = pyramid.split();
            self.dispatch.run_kernel(
                level_shape,
                current,
                &mut next[..level_shape.len()],
                |site, row, src| {
                    let lower = 2 * row as usize * site_count + site as usize;
                    let upper = lower + site_count;
                    if 2 * row as usize + 1 < rows {
                        src[lower].merge(src[upper])
                    } else {
                        src[lower]
                    }
                },
            )?;
            pyramid.swap();
            rows = next_rows;
            levels += 1;
        }

        let totals = &pyramid.current()[..site_count];
        let mut relaxed = Vec::with_capacity(site_count);
        let mut areas = Vec::with_capacity(site_count);
        let mut total_displacement = 0.0f64;
        let mut max_displacement = 0.0f64;
        for (site, total) in sites.iter().zip(totals) {
            let moved = match (total.centroid(), total.mean_color()) {
                (Some(pos), Some(color)) => Site::new(pos, color),
                _ => *site,
            };
            let displacement = site.pos.dist(&moved.pos) as f64;
            total_displacement += displacement;
            max_displacement = max_displacement.max(displacement);
            areas.push(total.count);
            relaxed.push(moved);
        }

        let result = Relaxation {
            sites: relaxed,
            areas,
            total_displacement,
            max_displacement,
            levels,
        };
        let degenerate = result.degenerate_sites();
        if degenerate > 0 {
            warn!("lloyd: {} of {} sites claim no cell, left in place", degenerate, site_count);
        }
        debug!(
            "lloyd: {} levels, displacement total {:.6} max {:.6}",
            levels, total_displacement, max_displacement
        );
        Ok(result)
    }
}

/// Cell ranges covered by `patch` when each axis is cut into `axis` strips
fn patch_bounds(
    shape: GridShape,
    axis: u32,
    patch: u32,
) -> (std::ops::Range<u32>, std::ops::Range<u32>) {
    let strip = |len: u32, i: u32| {
        let lo = (len as u64 * i as u64 / axis as u64) as u32;
        let hi = (len as u64 * (i + 1) as u64 / axis as u64) as u32;
        lo..hi
    };
    (strip(shape.width, patch % axis), strip(shape.height, patch / axis))
}
