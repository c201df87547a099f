//! Jump Flooding Algorithm over a fixed-resolution grid.
//!
//! Sites are splatted onto their nearest cells, then every pass lets each
//! cell adopt the closest site seen at nine offsets `{-s, 0, +s}²` in the
//! current buffer, writing into the next one. The offset starts at the grid
//! size and halves each pass.

use log::{debug, trace};

use crate::dispatch::{try_filled, CpuDispatch, Dispatch, GridShape};
use crate::site::{Position, Site, SiteId};
use crate::{JfaError, Result};

/// Sentinel site id of an unclaimed cell
pub const NO_SITE: u32 = u32::MAX;

/// Transient per-cell flooding state
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Claim {
    pub site: u32,
    /// Squared distance, in cells, from the cell center to the claimed site
    pub dist_sq: f32,
}

impl Claim {
    pub const EMPTY: Claim = Claim {
        site: NO_SITE,
        dist_sq: f32::INFINITY,
    };

    pub fn is_valid(&self) -> bool {
        self.site != NO_SITE
    }

    pub fn site_id(&self) -> Option<SiteId> {
        self.is_valid().then_some(self.site)
    }

    /// Closer wins; equal distances go to the lower site id.
    #[inline]
    pub fn beats(&self, other: &Claim) -> bool {
        self.dist_sq < other.dist_sq || (self.dist_sq == other.dist_sq && self.site < other.site)
    }
}

/// Two same-shaped buffers, one read and one written per pass.
#[derive(Debug, Clone)]
pub struct PingPong<T> {
    buffers: [Vec<T>; 2],
    current: usize,
    passes: usize,
}

impl<T: Clone> PingPong<T> {
    pub fn new(initial: Vec<T>) -> Self {
        let next = initial.clone();
        Self {
            buffers: [initial, next],
            current: 0,
            passes: 0,
        }
    }

    /// Two buffers of `len` copies of `value`, allocated fallibly
    pub fn filled(len: usize, value: T) -> Result<Self> {
        let initial = try_filled(len, value.clone())?;
        let next = try_filled(len, value)?;
        Ok(Self {
            buffers: [initial, next],
            current: 0,
            passes: 0,
        })
    }
}

impl<T> PingPong<T> {
    pub fn current(&self) -> &[T] {
        &self.buffers[self.current]
    }

    pub fn current_mut(&mut self) -> &mut [T] {
        &mut self.buffers[self.current]
    }

    /// `(current, next)` for one pass
    pub fn split(&mut self) -> (&[T], &mut [T]) {
        let [a, b] = &mut self.buffers;
        if self.current == 0 {
            (a.as_slice(), b.as_mut_slice())
        } else {
            (b.as_slice(), a.as_mut_slice())
        }
    }

    /// Make the buffer just written the current one.
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
        self.passes += 1;
    }

    /// Number of swaps so far
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn into_current(self) -> Vec<T> {
        let [a, b] = self.buffers;
        if self.current == 0 {
            a
        } else {
            b
        }
    }
}

/// Tuning knobs for [`JfaEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JfaConfig {
    /// Extra step-1 passes after the standard schedule (JFA+N)
    pub extra_passes: usize,
}

/// Nearest-site assignment produced by [`JfaEngine::run`]
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentGrid {
    shape: GridShape,
    claims: Vec<Claim>,
}

impl AssignmentGrid {
    pub fn new(shape: GridShape, claims: Vec<Claim>) -> Result<Self> {
        if claims.len() != shape.len() {
            return Err(JfaError::InvalidInput(format!(
                "{} claims for a {}x{} grid",
                claims.len(),
                shape.width,
                shape.height,
            )));
        }
        Ok(Self { shape, claims })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    /// Row-major claims
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn claim_at(&self, x: u32, y: u32) -> Claim {
        self.claims[self.shape.index(x, y)]
    }

    pub fn site_at(&self, x: u32, y: u32) -> Option<SiteId> {
        self.claim_at(x, y).site_id()
    }

    /// Center of cell `(x, y)` in normalized coordinates
    pub fn cell_center(&self, x: u32, y: u32) -> Position {
        Position::new(
            (x as f32 + 0.5) / self.shape.width as f32,
            (y as f32 + 0.5) / self.shape.height as f32,
        )
    }

    /// Cell count per site id
    pub fn areas(&self, site_count: usize) -> Vec<u32> {
        let mut areas = vec![0u32; site_count];
        for claim in &self.claims {
            if let Some(area) = areas.get_mut(claim.site as usize) {
                *area += 1;
            }
        }
        areas
    }

    pub fn unclaimed_cells(&self) -> usize {
        self.claims.iter().filter(|c| !c.is_valid()).count()
    }

    /// Row-major site ids, `-1` for unclaimed cells
    pub fn to_site_ids(&self) -> Vec<i32> {
        self.claims
            .iter()
            .map(|c| c.site_id().map_or(-1, |id| id as i32))
            .collect()
    }
}

/// `ceil(log2(max(w, h))) + 1`
pub fn step_count(shape: GridShape) -> usize {
    let side = shape.max_side();
    let ceil_log2 = u32::BITS - (side - 1).leading_zeros();
    ceil_log2 as usize + 1
}

/// Offsets of the standard schedule, starting at the grid size and halving
/// (rounding up) per pass.
pub fn step_schedule(shape: GridShape) -> Vec<(u32, u32)> {
    let mut step = (shape.width, shape.height);
    let mut schedule = Vec::with_capacity(step_count(shape));
    for _ in 0..step_count(shape) {
        schedule.push(step);
        step = (step.0.div_ceil(2), step.1.div_ceil(2));
    }
    schedule
}

/// Multi-pass nearest-site propagation.
#[derive(Debug, Clone, Default)]
pub struct JfaEngine<D = CpuDispatch> {
    dispatch: D,
    config: JfaConfig,
}

impl<D: Dispatch> JfaEngine<D> {
    pub fn new(dispatch: D) -> Self {
        Self::with_config(dispatch, JfaConfig::default())
    }

    pub fn with_config(dispatch: D, config: JfaConfig) -> Self {
        Self { dispatch, config }
    }

    pub fn config(&self) -> JfaConfig {
        self.config
    }

    /// Flood `sites` across a `width`x`height` grid.
    ///
    /// With no sites every cell stays unclaimed.
    pub fn run(&self, sites: &[Site], width: u32, height: u32) -> Result<AssignmentGrid> {
        let shape = GridShape::new(width, height)?;
        let site_cells = site_cell_positions(sites, shape)?;

        let mut grid = PingPong::filled(shape.len(), Claim::EMPTY)?;
        splat(grid.current_mut(), shape, &site_cells);

        let mut schedule = step_schedule(shape);
        schedule.extend(std::iter::repeat((1, 1)).take(self.config.extra_passes));
        debug!(
            "jfa: {} sites on {}x{}, {} passes",
            sites.len(),
            width,
            height,
            schedule.len()
        );

        for &step in &schedule {
            let (current, next) = grid.split();
            self.dispatch.run_kernel(shape, current, next, |x, y, src| {
                flood_cell(shape, step, &site_cells, x, y, src)
            })?;
            grid.swap();
            trace!("jfa: pass {} step {:?}", grid.passes(), step);
        }

        AssignmentGrid::new(shape, grid.into_current())
    }
}

/// Site positions in cell units, validated
fn site_cell_positions(sites: &[Site], shape: GridShape) -> Result<Vec<[f32; 2]>> {
    if sites.len() >= NO_SITE as usize {
        return Err(JfaError::InvalidInput(format!("{} sites exceed the id space", sites.len())));
    }
    sites
        .iter()
        .enumerate()
        .map(|(id, site)| {
            if !site.pos.x.is_finite() || !site.pos.y.is_finite() {
                return Err(JfaError::InvalidInput(format!(
                    "site {} has non-finite position {:?}",
                    id, site.pos
                )));
            }
            Ok([site.pos.x * shape.width as f32, site.pos.y * shape.height as f32])
        })
        .collect()
}

#[inline]
fn cell_dist_sq(x: u32, y: u32, site: [f32; 2]) -> f32 {
    let dx = x as f32 + 0.5 - site[0];
    let dy = y as f32 + 0.5 - site[1];
    dx * dx + dy * dy
}

/// Seed each site's own cell. When two sites land in one cell the lower id
/// keeps it, the same rule the device splat applies with `atomicMin`.
fn splat(cells: &mut [Claim], shape: GridShape, site_cells: &[[f32; 2]]) {
    for (id, &site) in site_cells.iter().enumerate() {
        let x = (site[0].floor().max(0.0) as u32).min(shape.width - 1);
        let y = (site[1].floor().max(0.0) as u32).min(shape.height - 1);
        let cell = &mut cells[shape.index(x, y)];
        if !cell.is_valid() {
            *cell = Claim {
                site: id as u32,
                dist_sq: 0.0,
            };
        }
    }
}

/// One cell of one pass: best claim among the nine samples at `step`.
#[inline]
fn flood_cell(
    shape: GridShape,
    step: (u32, u32),
    site_cells: &[[f32; 2]],
    x: u32,
    y: u32,
    current: &[Claim],
) -> Claim {
    let mut best = Claim::EMPTY;
    for dy in [-1i64, 0, 1] {
        let sy = y as i64 + dy * step.1 as i64;
        if sy < 0 || sy >= shape.height as i64 {
            continue;
        }
        for dx in [-1i64, 0, 1] {
            let sx = x as i64 + dx * step.0 as i64;
            if sx < 0 || sx >= shape.width as i64 {
                continue;
            }
            let sample = current[shape.index(sx as u32, sy as u32)];
            if !sample.is_valid() {
                continue;
            }
            let candidate = Claim {
                site: sample.site,
                dist_sq: cell_dist_sq(x, y, site_cells[sample.site as usize]),
            };
            if candidate.beats(&best) {
                best = candidate;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::Color;

    fn site(x: f32, y: f32) -> Site {
        Site::new(Position::new(x, y), Color::default())
    }

    #[test]
    fn test_step_schedule() {
        let square = GridShape::new(8, 8).unwrap();
        assert_eq!(step_count(square), 4);
        assert_eq!(step_schedule(square), vec![(8, 8), (4, 4), (2, 2), (1, 1)]);

        let wide = GridShape::new(10, 3).unwrap();
        assert_eq!(
            step_schedule(wide),
            vec![(10, 3), (5, 2), (3, 1), (2, 1), (1, 1)]
        );

        assert_eq!(step_count(GridShape::new(1, 1).unwrap()), 1);
        assert_eq!(step_count(GridShape::new(1920, 1080).unwrap()), 12);
    }

    #[test]
    fn test_ping_pong_roles() {
        let mut buffers = PingPong::new(vec![0u8; 4]);
        {
            let (current, next) = buffers.split();
            assert_eq!(current, &[0; 4]);
            next.fill(1);
        }
        buffers.swap();
        assert_eq!(buffers.current(), &[1; 4]);
        {
            let (current, next) = buffers.split();
            assert_eq!(current, &[1; 4]);
            next.fill(2);
        }
        buffers.swap();
        assert_eq!(buffers.passes(), 2);
        assert_eq!(buffers.into_current(), vec![2; 4]);
    }

    #[test]
    fn test_no_sites_leaves_grid_unclaimed() {
        let grid = JfaEngine::new(CpuDispatch::new()).run(&[], 16, 9).unwrap();
        assert_eq!(grid.unclaimed_cells(), 16 * 9);
        assert!(grid.to_site_ids().iter().all(|&id| id == -1));
        assert_eq!(grid.areas(0), Vec::<u32>::new());
    }

    #[test]
    fn test_invalid_dimensions() {
        let engine = JfaEngine::new(CpuDispatch::new());
        assert!(matches!(
            engine.run(&[site(0.5, 0.5)], 0, 4),
            Err(JfaError::InvalidGrid { width: 0, height: 4 })
        ));
        assert!(engine.run(&[site(f32::NAN, 0.5)], 4, 4).is_err());
    }

    #[test]
    fn test_tie_goes_to_lowest_id() {
        let engine = JfaEngine::new(CpuDispatch::serial());

        // cell 1 (center 1.5) is exactly 1.0 from both sites
        let grid = engine.run(&[site(0.625, 0.5), site(0.125, 0.5)], 4, 1).unwrap();
        let ids: Vec<_> = (0..4).map(|x| grid.site_at(x, 0)).collect();
        assert_eq!(ids, vec![Some(1), Some(0), Some(0), Some(0)]);

        let grid = engine.run(&[site(0.125, 0.5), site(0.625, 0.5)], 4, 1).unwrap();
        let ids: Vec<_> = (0..4).map(|x| grid.site_at(x, 0)).collect();
        assert_eq!(ids, vec![Some(0), Some(0), Some(1), Some(1)]);
    }

    #[test]
    fn test_shared_cell_keeps_lower_id() {
        let engine = JfaEngine::new(CpuDispatch::serial());
        // both in cell (0, 0) of a 2x2 grid; site 1 loses its seed entirely
        let grid = engine.run(&[site(0.05, 0.05), site(0.25, 0.25)], 2, 2).unwrap();
        assert_eq!(grid.site_at(0, 0), Some(0));
        assert_eq!(grid.areas(2), vec![4, 0]);
    }

    #[test]
    fn test_sites_outside_unit_square_clamp() {
        let engine = JfaEngine::new(CpuDispatch::new());
        let grid = engine.run(&[site(-0.5, 2.0)], 4, 4).unwrap();
        assert_eq!(grid.unclaimed_cells(), 0);
        assert_eq!(grid.site_at(0, 3), Some(0));
    }

    #[test]
    fn test_oversized_grid_reports_error() {
        let engine = JfaEngine::new(CpuDispatch::serial());
        let err = engine.run(&[], u32::MAX, u32::MAX).unwrap_err();
        assert!(matches!(
            err,
            JfaError::ResourceExhaustion { .. } | JfaError::InvalidGrid { .. }
        ));
    }
}
