//! WASM bindings for jfa-core.
//!
//! Exposes a stateful `LloydEngine` for an interactive canvas: clicks add
//! sites, a key press regenerates them, and every animation frame floods
//! the grid and takes one Lloyd step. Frames come back as flat arrays for
//! cheap JS interop.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use wasm_bindgen::prelude::*;

use jfa_core::{
    render, Color, CpuDispatch, GridShape, HostAllocator, JfaEngine, JfaError, Position,
    ReductionEngine, RenderStyle, Site, SiteMirror, SiteStore,
};

#[wasm_bindgen(start)]
pub fn init_panic_hook() {
    console_error_panic_hook::set_once();
}

fn site_count(count: i32) -> Result<usize, JfaError> {
    usize::try_from(count)
        .map_err(|_| JfaError::InvalidInput(format!("site count must not be negative, got {}", count)))
}

/// One tessellated (and possibly relaxed) frame.
#[wasm_bindgen]
pub struct LloydFrame {
    site_of: Vec<i32>,
    pixels: Vec<u8>,
    positions: Vec<f32>,
    max_displacement: f64,
    width: u32,
    height: u32,
}

#[wasm_bindgen]
impl LloydFrame {
    /// Site id for each cell (row-major, -1 where unclaimed)
    #[wasm_bindgen(getter)]
    pub fn site_of(&self) -> Vec<i32> {
        self.site_of.clone()
    }

    /// RGBA pixels, ready for `ImageData`
    #[wasm_bindgen(getter)]
    pub fn pixels(&self) -> Vec<u8> {
        self.pixels.clone()
    }

    /// Flat [x0,y0, x1,y1, ...] site positions the frame was flooded from
    #[wasm_bindgen(getter)]
    pub fn positions(&self) -> Vec<f32> {
        self.positions.clone()
    }

    /// Largest site move of this frame's Lloyd step (0 when paused)
    #[wasm_bindgen(getter)]
    pub fn max_displacement(&self) -> f64 {
        self.max_displacement
    }

    #[wasm_bindgen(getter)]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[wasm_bindgen(getter)]
    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Stateful tessellation engine.
/// Sites are edited on the host and mirrored one dirty range at a time.
#[wasm_bindgen]
pub struct LloydEngine {
    shape: GridShape,
    store: SiteStore,
    mirror: SiteMirror<HostAllocator>,
    jfa: JfaEngine,
    reduction: ReductionEngine,
    rng: ChaCha8Rng,
    style: RenderStyle,
    relaxing: bool,
    /// Timestamp of the last regenerate request that was honored
    last_regenerate: f64,
}

impl LloydEngine {
    fn create(width: i32, height: i32, sites: i32, seed: u32) -> Result<Self, JfaError> {
        let shape = GridShape::from_signed(width as i64, height as i64)?;
        let count = site_count(sites)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);
        let mut store = SiteStore::new();
        store.regenerate(count, &mut rng);

        // the browser main thread has no worker pool
        let dispatch = CpuDispatch::serial();
        Ok(Self {
            shape,
            store,
            mirror: SiteMirror::new(HostAllocator::new(), count)?,
            jfa: JfaEngine::new(dispatch),
            reduction: ReductionEngine::new(dispatch),
            rng,
            style: RenderStyle {
                draw_sites: true,
                ..RenderStyle::default()
            },
            relaxing: true,
            last_regenerate: f64::NEG_INFINITY,
        })
    }

    fn regenerate_at(&mut self, count: i32, timestamp: f64) -> Result<bool, JfaError> {
        let count = site_count(count)?;
        // key repeat can deliver events out of order; only the newest counts
        if timestamp <= self.last_regenerate {
            return Ok(false);
        }
        self.last_regenerate = timestamp;
        self.store.regenerate(count, &mut self.rng);
        Ok(true)
    }

    fn add_site_at(&mut self, x: f32, y: f32) -> Result<u32, JfaError> {
        // the store can't drop a single site, so reject before appending
        if !x.is_finite() || !y.is_finite() {
            return Err(JfaError::InvalidInput(format!(
                "click position must be finite, got ({}, {})",
                x, y
            )));
        }
        let color = Color::random(&mut self.rng);
        Ok(self.store.append(Site::new(Position::new(x, y), color)))
    }

    fn step(&mut self) -> Result<LloydFrame, JfaError> {
        self.mirror.sync(&mut self.store)?;
        let sites = self.mirror.read_sites()?;
        let grid = self.jfa.run(&sites, self.shape.width, self.shape.height)?;

        let mut max_displacement = 0.0;
        if self.relaxing {
            let relaxed = self.reduction.relax(&grid, &sites)?;
            max_displacement = relaxed.max_displacement;
            self.store.replace_all(relaxed.sites);
        }

        let image = render(&grid, &sites, &self.style);
        let pixels = image.pixels().flat_map(|p| [p.0[0], p.0[1], p.0[2], 255]).collect();
        Ok(LloydFrame {
            site_of: grid.to_site_ids(),
            pixels,
            positions: sites.iter().flat_map(|s| [s.pos.x, s.pos.y]).collect(),
            max_displacement,
            width: self.shape.width,
            height: self.shape.height,
        })
    }
}

#[wasm_bindgen]
impl LloydEngine {
    /// Create an engine with `sites` random sites on a `width` x `height` grid.
    #[wasm_bindgen(constructor)]
    pub fn new(width: i32, height: i32, sites: i32, seed: u32) -> Result<LloydEngine, JsError> {
        Ok(Self::create(width, height, sites, seed)?)
    }

    /// Add a site at normalized canvas coordinates; returns its id.
    pub fn add_site(&mut self, x: f32, y: f32) -> Result<u32, JsError> {
        Ok(self.add_site_at(x, y)?)
    }

    /// Replace every site with `count` random ones.
    /// Requests older than the last honored one are ignored.
    pub fn regenerate(&mut self, count: i32, timestamp: f64) -> Result<bool, JsError> {
        Ok(self.regenerate_at(count, timestamp)?)
    }

    /// Regenerate, stamped with the current time.
    pub fn regenerate_now(&mut self, count: i32) -> Result<bool, JsError> {
        Ok(self.regenerate_at(count, js_sys::Date::now())?)
    }

    /// Pause or resume Lloyd steps; paused frames only tessellate.
    pub fn set_relaxing(&mut self, relaxing: bool) {
        self.relaxing = relaxing;
    }

    pub fn set_style(&mut self, draw_sites: bool, draw_borders: bool, line_width: u32) {
        self.style = RenderStyle {
            draw_sites,
            draw_borders,
            line_width,
        };
    }

    /// Tessellate the current sites and, unless paused, relax them once.
    pub fn frame(&mut self) -> Result<LloydFrame, JsError> {
        Ok(self.step()?)
    }

    pub fn site_count(&self) -> usize {
        self.store.len()
    }

    /// Number of uploads made to the site mirror so far
    pub fn uploads(&self) -> u32 {
        self.mirror.uploads()
    }
}
