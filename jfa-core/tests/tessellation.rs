//! Jump flooding against a brute-force nearest-site oracle.

use std::collections::HashSet;

use jfa_core::{
    Color, CpuDispatch, JfaConfig, JfaEngine, Position, ReductionEngine, Site, SiteStore, NO_SITE,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Squared distances stored by the flood may round differently from the
/// oracle's; anything within this is the same answer.
const DIST_EPSILON: f32 = 1e-3;

/// Sites that keep their seed cell. When several sites fall in one cell
/// only the lowest id is flooded, so the oracle only knows about that one.
fn seeded_sites(sites: &[Site], width: u32, height: u32) -> Vec<Site> {
    let mut taken = HashSet::new();
    sites
        .iter()
        .filter(|s| {
            let x = ((s.pos.x * width as f32).floor().max(0.0) as u32).min(width - 1);
            let y = ((s.pos.y * height as f32).floor().max(0.0) as u32).min(height - 1);
            taken.insert((x, y))
        })
        .copied()
        .collect()
}

fn brute_force_dist_sq(sites: &[Site], width: u32, height: u32, x: u32, y: u32) -> f32 {
    sites
        .iter()
        .map(|s| {
            let dx = x as f32 + 0.5 - s.pos.x * width as f32;
            let dy = y as f32 + 0.5 - s.pos.y * height as f32;
            dx * dx + dy * dy
        })
        .fold(f32::INFINITY, f32::min)
}

/// Fraction of cells whose claim is farther than the true nearest site
fn mismatch_fraction(sites: &[Site], width: u32, height: u32, extra_passes: usize) -> f64 {
    let engine = JfaEngine::with_config(CpuDispatch::new(), JfaConfig { extra_passes });
    let grid = engine.run(sites, width, height).unwrap();
    let seeded = seeded_sites(sites, width, height);
    let mut mismatches = 0usize;
    for y in 0..height {
        for x in 0..width {
            let claim = grid.claim_at(x, y);
            assert!(claim.is_valid(), "cell ({}, {}) left unclaimed", x, y);
            let best = brute_force_dist_sq(&seeded, width, height, x, y);
            assert!(claim.dist_sq + DIST_EPSILON >= best, "claim closer than the nearest site");
            if claim.dist_sq > best + DIST_EPSILON {
                mismatches += 1;
            }
        }
    }
    mismatches as f64 / (width * height) as f64
}

#[test]
fn test_matches_brute_force() {
    for seed in [0, 1, 42] {
        let store = SiteStore::random(64, seed);
        let plain = mismatch_fraction(store.sites(), 256, 256, 0);
        let plus_one = mismatch_fraction(store.sites(), 256, 256, 1);
        assert!(plain <= 0.005, "seed {}: {:.4}% of cells mismatched", seed, plain * 100.0);
        assert!(plus_one <= plain, "seed {}: JFA+1 made things worse", seed);
    }
}

#[test]
fn test_non_square_grids() {
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    for (width, height) in [(200, 37), (37, 200), (300, 90)] {
        let count = rng.gen_range(1..=20);
        let sites: Vec<Site> = (0..count).map(|_| Site::random(&mut rng)).collect();
        let fraction = mismatch_fraction(&sites, width, height, 1);
        assert!(fraction <= 0.01, "{}x{}: {:.4}% mismatched", width, height, fraction * 100.0);
    }
}

#[test]
fn test_quadrant_sites_on_8x8() {
    let sites: Vec<Site> = [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)]
        .iter()
        .map(|&(x, y)| Site::new(Position::new(x, y), Color::new(x, y, 0.5)))
        .collect();
    let grid = JfaEngine::new(CpuDispatch::new()).run(&sites, 8, 8).unwrap();

    for y in 0..8 {
        for x in 0..8 {
            let expected = (x / 4) + 2 * (y / 4);
            assert_eq!(grid.site_at(x, y), Some(expected), "cell ({}, {})", x, y);
        }
    }
    assert_eq!(grid.areas(4), vec![16; 4]);
}

#[test]
fn test_zero_sites() {
    let grid = JfaEngine::new(CpuDispatch::new()).run(&[], 16, 9).unwrap();
    assert!(grid.claims().iter().all(|c| !c.is_valid() && c.site == NO_SITE));
    assert_eq!(grid.unclaimed_cells(), 16 * 9);

    let step = ReductionEngine::new(CpuDispatch::new()).relax(&grid, &[]).unwrap();
    assert!(step.sites.is_empty());
    assert_eq!(step.max_displacement, 0.0);
}

#[test]
fn test_invalid_dimensions_rejected() {
    let engine = JfaEngine::new(CpuDispatch::new());
    assert!(engine.run(&[], 0, 8).is_err());
    assert!(engine.run(&[], 8, 0).is_err());
}
