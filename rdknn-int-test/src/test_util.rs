use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdknn::{
    BruteForceOracle, DiskPageStore, DistanceKind, MemoryPageStore, Neighbor, ObjectId, PageStore,
    Point, RdKnnSettings, RdKnnTree, RknnResult, StoreOptions,
};
use std::collections::BTreeMap;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Runs a test between a setup and a teardown step.
/// The teardown also runs when the test fails or panics.
pub fn run_test<S, T, B, A>(before: B, test: T, after: A)
where
    S: PageStore,
    B: Fn() -> RknnResult<TestContext<S>>,
    T: Fn(TestContext<S>) -> RknnResult<()>,
    A: Fn(TestContext<S>) -> RknnResult<()>,
{
    let start_time = Instant::now();
    let ctx = match before() {
        Ok(ctx) => ctx,
        Err(e) => panic!("Before run failed: {:?}", e),
    };

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| test(ctx.clone())));
    let after_result = after(ctx);
    let elapsed = start_time.elapsed();

    match result {
        Ok(Ok(())) => {
            if let Err(e) = after_result {
                panic!("After run failed: {:?}", e);
            }
            log::debug!("Test finished in {:?}", elapsed);
        }
        Ok(Err(e)) => panic!("Test failed after {:?}: {:?}", elapsed, e),
        Err(panic_err) => std::panic::resume_unwind(panic_err),
    }
}

/// A tree under test, with the directory of its file for disk trees.
pub struct TestContext<S: PageStore = MemoryPageStore> {
    path: Option<PathBuf>,
    tree: RdKnnTree<S>,
}

impl<S: PageStore> Clone for TestContext<S> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            tree: self.tree.clone(),
        }
    }
}

impl<S: PageStore> TestContext<S> {
    pub fn tree(&self) -> RdKnnTree<S> {
        self.tree.clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl TestContext<DiskPageStore> {
    /// File of the tree
    pub fn file(&self) -> PathBuf {
        index_file(self.path.as_deref().unwrap_or_else(|| Path::new(".")))
    }
}

pub fn random_path() -> PathBuf {
    std::env::temp_dir().join(format!("rdknn-test-{:016x}", rand::random::<u64>()))
}

pub fn index_file(dir: &Path) -> PathBuf {
    dir.join("index.rdknn")
}

/// Settings with small pages so that a few hundred points already build
/// trees of several levels.
pub fn small_settings(k_max: usize) -> RdKnnSettings {
    settings_with(k_max, DistanceKind::Euclidean, 2)
}

pub fn settings_with(k_max: usize, distance: DistanceKind, dimensionality: usize) -> RdKnnSettings {
    RdKnnSettings::builder()
        .k_max(k_max)
        .dimensionality(dimensionality)
        .page_size(256 * dimensionality)
        .distance(distance)
        .build()
        .unwrap_or_else(|e| panic!("invalid test settings: {}", e))
}

pub fn create_memory_context(settings: RdKnnSettings) -> RknnResult<TestContext> {
    Ok(TestContext {
        path: None,
        tree: RdKnnTree::in_memory(settings)?,
    })
}

pub fn create_disk_context(settings: RdKnnSettings) -> RknnResult<TestContext<DiskPageStore>> {
    create_disk_context_with_cache(settings, 16)
}

/// Disk context whose store caches at most `cache_pages` pages
pub fn create_disk_context_with_cache(
    settings: RdKnnSettings,
    cache_pages: usize,
) -> RknnResult<TestContext<DiskPageStore>> {
    let dir = random_path();
    fs::create_dir_all(&dir)?;
    let options = StoreOptions {
        cache_pages,
        ..StoreOptions::default()
    };
    let tree = RdKnnTree::create_with_options(index_file(&dir), settings, options)?;
    Ok(TestContext {
        path: Some(dir),
        tree,
    })
}

pub fn cleanup<S: PageStore>(ctx: TestContext<S>) -> RknnResult<()> {
    ctx.tree.close()?;
    if let Some(dir) = ctx.path {
        // other clones of the tree may still hold the file open
        let _ = fs::remove_dir_all(dir);
    }
    Ok(())
}

/// Uniformly distributed points, reproducible from the seed.
pub fn random_points(n: usize, dimensionality: usize, seed: u64) -> Vec<(ObjectId, Point)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n as u64)
        .map(|id| {
            let coords: Vec<f64> = (0..dimensionality)
                .map(|_| rng.random_range(0.0..100.0))
                .collect();
            (id, Point::new(coords))
        })
        .collect()
}

/// Points drawn around a few centres, so that neighbourhoods differ in size.
pub fn clustered_points(n: usize, clusters: usize, seed: u64) -> Vec<(ObjectId, Point)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centres: Vec<[f64; 2]> = (0..clusters)
        .map(|_| [rng.random_range(0.0..1000.0), rng.random_range(0.0..1000.0)])
        .collect();
    (0..n as u64)
        .map(|id| {
            let c = centres[id as usize % clusters];
            let spread = 5.0 + 20.0 * (id as usize % clusters) as f64;
            let p = Point::from([
                c[0] + rng.random_range(-spread..spread),
                c[1] + rng.random_range(-spread..spread),
            ]);
            (id, p)
        })
        .collect()
}

pub fn random_query(rng: &mut StdRng, dimensionality: usize) -> Point {
    Point::new(
        (0..dimensionality)
            .map(|_| rng.random_range(-10.0..110.0))
            .collect(),
    )
}

pub fn oracle(distance: DistanceKind, points: &[(ObjectId, Point)]) -> BruteForceOracle {
    BruteForceOracle::new(distance, points.iter().cloned())
}

/// Exact `k`-distance of every object, by linear scan.
pub fn expected_knn_distances(
    distance: DistanceKind,
    points: &[(ObjectId, Point)],
    k: usize,
) -> BTreeMap<ObjectId, f64> {
    let oracle = oracle(distance, points);
    points
        .iter()
        .map(|(id, p)| (*id, oracle.k_nearest_to(p, k, Some(*id)).kth_distance(k)))
        .collect()
}

pub fn ids(neighbors: &[Neighbor]) -> Vec<ObjectId> {
    neighbors.iter().map(|n| n.id).collect()
}

pub fn sorted_by_id(mut neighbors: Vec<Neighbor>) -> Vec<Neighbor> {
    neighbors.sort_by_key(|n| n.id);
    neighbors
}
