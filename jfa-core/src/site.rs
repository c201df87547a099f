//! Sites, the site store and its device mirror.

use std::ops::Range;

use log::trace;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::growable::{DeviceAllocator, RecordBuffer};
use crate::{JfaError, Result};

/// Index of a site in its store; grid cells refer to sites by this id.
pub type SiteId = u32;

/// 2D position in normalized `[0, 1]²` space
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Squared distance to another position
    pub fn dist_sq(&self, other: &Position) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn dist(&self, other: &Position) -> f32 {
        self.dist_sq(other).sqrt()
    }
}

/// Linear RGB color, components in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::new(rng.gen(), rng.gen(), rng.gen())
    }

    pub fn to_rgb8(&self) -> [u8; 3] {
        let quantize = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        [quantize(self.r), quantize(self.g), quantize(self.b)]
    }

    pub fn from_rgb8(rgb: [u8; 3]) -> Self {
        Self::new(
            rgb[0] as f32 / 255.0,
            rgb[1] as f32 / 255.0,
            rgb[2] as f32 / 255.0,
        )
    }
}

/// A Voronoi site
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Site {
    pub pos: Position,
    pub color: Color,
}

impl Site {
    pub fn new(pos: Position, color: Color) -> Self {
        Self { pos, color }
    }

    /// Uniformly random position and color
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let pos = Position::new(rng.gen(), rng.gen());
        Self::new(pos, Color::random(rng))
    }
}

/// Half-open interval of site indices not yet pushed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyRange {
    pub lo: usize,
    pub hi: usize,
}

impl DirtyRange {
    pub const EMPTY: DirtyRange = DirtyRange { lo: 0, hi: 0 };

    pub fn new(lo: usize, hi: usize) -> Self {
        if hi <= lo {
            Self::EMPTY
        } else {
            Self { lo, hi }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hi <= self.lo
    }

    pub fn len(&self) -> usize {
        self.hi.saturating_sub(self.lo)
    }

    /// Smallest interval covering both
    pub fn union(self, other: DirtyRange) -> DirtyRange {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => DirtyRange {
                lo: self.lo.min(other.lo),
                hi: self.hi.max(other.hi),
            },
        }
    }

    pub fn as_range(&self) -> Range<usize> {
        self.lo..self.hi
    }
}

/// Ordered, append-only-until-reset collection of sites.
///
/// Every mutation widens a single pending [`DirtyRange`]; [`SiteStore::flush`]
/// hands it out once and resets it.
#[derive(Debug, Clone, Default)]
pub struct SiteStore {
    sites: Vec<Site>,
    dirty: DirtyRange,
}

impl SiteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding `sites`, all of them pending
    pub fn from_sites(sites: Vec<Site>) -> Self {
        let mut store = Self::new();
        store.replace_all(sites);
        store
    }

    /// `count` uniformly random sites from a seeded RNG
    pub fn random(count: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut store = Self::new();
        store.regenerate(count, &mut rng);
        store
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn get(&self, id: SiteId) -> Option<&Site> {
        self.sites.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.sites.iter().map(|s| s.pos).collect()
    }

    /// Add one site; existing ids stay valid.
    pub fn append(&mut self, site: Site) -> SiteId {
        let id = self.sites.len();
        self.sites.push(site);
        self.mark(DirtyRange::new(id, id + 1));
        id as SiteId
    }

    /// Edit one site in place.
    pub fn update(&mut self, id: SiteId, site: Site) -> Result<()> {
        let idx = id as usize;
        let slot = self.sites.get_mut(idx).ok_or_else(|| {
            JfaError::InvalidInput(format!("site id {} out of range", id))
        })?;
        *slot = site;
        self.mark(DirtyRange::new(idx, idx + 1));
        Ok(())
    }

    /// Clear the sequence and take `sites` as the new one, all pending.
    pub fn replace_all(&mut self, sites: Vec<Site>) {
        self.dirty = DirtyRange::new(0, sites.len());
        self.sites = sites;
    }

    /// Replace everything with `count` random sites.
    pub fn regenerate<R: Rng + ?Sized>(&mut self, count: usize, rng: &mut R) {
        let sites = (0..count).map(|_| Site::random(rng)).collect();
        self.replace_all(sites);
    }

    /// Range still waiting to be flushed (may be empty)
    pub fn pending(&self) -> DirtyRange {
        self.dirty
    }

    /// Take the pending range, leaving `[0, 0)` behind.
    pub fn flush(&mut self) -> Option<DirtyRange> {
        let range = std::mem::take(&mut self.dirty);
        (!range.is_empty()).then_some(range)
    }

    fn mark(&mut self, range: DirtyRange) {
        self.dirty = self.dirty.union(range);
    }
}

/// Device layout of one site, padded to 32 bytes (two std140 `vec4`s).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SiteRecord {
    pub pos: [f32; 2],
    pub _pad0: [f32; 2],
    pub color: [f32; 3],
    pub _pad1: f32,
}

impl From<&Site> for SiteRecord {
    fn from(site: &Site) -> Self {
        Self {
            pos: [site.pos.x, site.pos.y],
            _pad0: [0.0; 2],
            color: [site.color.r, site.color.g, site.color.b],
            _pad1: 0.0,
        }
    }
}

impl From<SiteRecord> for Site {
    fn from(record: SiteRecord) -> Self {
        Site::new(
            Position::new(record.pos[0], record.pos[1]),
            Color::new(record.color[0], record.color[1], record.color[2]),
        )
    }
}

/// Device-resident copy of a [`SiteStore`], updated one dirty range at a time.
pub struct SiteMirror<A: DeviceAllocator> {
    records: RecordBuffer<SiteRecord, A>,
    uploads: u32,
}

impl<A: DeviceAllocator> SiteMirror<A> {
    pub fn new(allocator: A, initial_sites: usize) -> Result<Self> {
        Ok(Self {
            records: RecordBuffer::new(allocator, initial_sites as u64)?,
            uploads: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of non-empty uploads performed
    pub fn uploads(&self) -> u32 {
        self.uploads
    }

    pub fn buffer(&self) -> &A::Buffer {
        self.records.bytes().buffer()
    }

    /// Push the store's pending range and flush it.
    ///
    /// The store is only flushed once the upload succeeded, so a failed
    /// upload can be retried.
    pub fn sync(&mut self, store: &mut SiteStore) -> Result<Option<DirtyRange>> {
        if store.len() < self.records.len() {
            self.records.truncate(store.len())?;
        }
        let pending = store.pending();
        if pending.is_empty() {
            return Ok(None);
        }

        // never leave a hole between mirrored and pending records
        let range = DirtyRange::new(pending.lo.min(self.records.len()), pending.hi);
        let records: Vec<SiteRecord> = store.sites()[range.as_range()]
            .iter()
            .map(SiteRecord::from)
            .collect();
        self.records.write_from(range.lo, &records)?;
        self.uploads += 1;
        trace!("site mirror: uploaded [{}, {})", range.lo, range.hi);

        store.flush();
        Ok(Some(range))
    }

    pub fn read_sites(&mut self) -> Result<Vec<Site>> {
        Ok(self.records.records()?.into_iter().map(Site::from).collect())
    }
}
