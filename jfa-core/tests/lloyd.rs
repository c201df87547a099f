//! Lloyd iteration: run + relax cycles on synthetic site sets.

use jfa_core::{
    Color, CpuDispatch, HostAllocator, JfaEngine, Position, ReductionEngine, Site, SiteMirror,
    SiteStore,
};

fn lattice(per_side: u32) -> Vec<Site> {
    let mut sites = Vec::new();
    for j in 0..per_side {
        for i in 0..per_side {
            let x = (i as f32 + 0.5) / per_side as f32;
            let y = (j as f32 + 0.5) / per_side as f32;
            sites.push(Site::new(Position::new(x, y), Color::new(x, y, 0.0)));
        }
    }
    sites
}

#[test]
fn test_centroidal_sites_stay_put() {
    let jfa = JfaEngine::new(CpuDispatch::new());
    let reduction = ReductionEngine::new(CpuDispatch::new());

    for (sites, size) in [(lattice(2), 8), (lattice(4), 64), (lattice(1), 33)] {
        let grid = jfa.run(&sites, size, size).unwrap();
        let step = reduction.relax(&grid, &sites).unwrap();
        for (before, after) in sites.iter().zip(&step.sites) {
            assert!(
                before.pos.dist(&after.pos) < 1e-5,
                "{:?} moved to {:?}",
                before.pos,
                after.pos
            );
        }
        assert!(step.max_displacement < 1e-5);
    }
}

#[test]
fn test_displacement_decreases() {
    let jfa = JfaEngine::new(CpuDispatch::new());
    let reduction = ReductionEngine::new(CpuDispatch::new());
    let mut store = SiteStore::random(16, 1234);

    let mut displacements = Vec::new();
    for _ in 0..8 {
        let grid = jfa.run(store.sites(), 64, 64).unwrap();
        let step = reduction.relax(&grid, store.sites()).unwrap();
        displacements.push(step.total_displacement);
        store.replace_all(step.sites);
    }

    let early: f64 = displacements[..3].iter().sum();
    let late: f64 = displacements[5..].iter().sum();
    assert!(late < early, "displacements did not shrink: {:?}", displacements);
    assert!(displacements[7] < displacements[0]);
}

#[test]
fn test_relaxed_sites_stay_in_unit_square() {
    let jfa = JfaEngine::new(CpuDispatch::new());
    let reduction = ReductionEngine::new(CpuDispatch::new());
    let mut store = SiteStore::random(40, 5);

    for _ in 0..5 {
        let grid = jfa.run(store.sites(), 48, 80).unwrap();
        let step = reduction.relax(&grid, store.sites()).unwrap();
        assert_eq!(step.areas.iter().map(|&a| a as usize).sum::<usize>(), 48 * 80);
        store.replace_all(step.sites);
    }
    for site in store.sites() {
        assert!((0.0..=1.0).contains(&site.pos.x) && (0.0..=1.0).contains(&site.pos.y));
    }
}

#[test]
fn test_mirror_follows_relaxation() {
    let jfa = JfaEngine::new(CpuDispatch::serial());
    let reduction = ReductionEngine::new(CpuDispatch::serial());
    let mut store = SiteStore::random(12, 77);
    let mut mirror = SiteMirror::new(HostAllocator::new(), 4).unwrap();

    for _ in 0..3 {
        mirror.sync(&mut store).unwrap();
        let mirrored = mirror.read_sites().unwrap();
        assert_eq!(mirrored, store.sites());

        let grid = jfa.run(&mirrored, 32, 32).unwrap();
        let step = reduction.relax(&grid, &mirrored).unwrap();
        store.replace_all(step.sites);
    }

    // a click adds one site; only that record is uploaded
    let id = store.append(Site::new(Position::new(0.5, 0.5), Color::new(1.0, 1.0, 1.0)));
    mirror.sync(&mut store).unwrap();
    let range = store.pending();
    assert!(range.is_empty());
    assert_eq!(mirror.len(), 13);
    assert_eq!(mirror.read_sites().unwrap()[id as usize], store.sites()[id as usize]);
}
