use poolcore::{*, analyze::placement_spread};
use rand::{rngs::StdRng, SeedableRng};

/// Draws placements against the current free space without claiming them,
/// to eyeball how evenly the sampler spreads blocks
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the block store
    #[arg(short, long, env = "POOL_DATA_DIR", default_value = "pool-data")]
    #[arg(value_parser = clap::value_parser!(PathBuf))]
    data_dir:   PathBuf,

    /// First key of the puzzle (hex)
    #[arg(long, env = "PUZZLE_START_RANGE")]
    start:      String,

    /// One past the last key of the puzzle (hex)
    #[arg(long, env = "PUZZLE_END_RANGE")]
    end:        String,

    #[arg(long, env = "BLOCK_RANGE_MIN_KEYS")]
    min_keys:   Option<String>,

    #[arg(long, env = "BLOCK_RANGE_MAX_KEYS")]
    max_keys:   Option<String>,

    /// Number of placements to draw
    #[arg(short = 'n', long, default_value_t = 30)]
    trials:     usize,

    /// Seed for reproducible draws
    #[arg(short, long)]
    seed:       Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Args::parse();
    init_tracing();

    let config = PoolConfig::from_text(
        &cli.start,
        &cli.end,
        cli.min_keys.as_deref(),
        cli.max_keys.as_deref(),
        AllocatorConfig::default(),
    )?;
    let store = FileStore::open(cli.data_dir.join("blocks.json"))?;
    // Nothing gets allocated here, so no shared lock is needed.
    let pool = AllocationCoordinator::new(store, MemoryLock::new(), config.allocator.clone());
    let free = pool.free_segments(&config.puzzle)?;

    let mut rng = match cli.seed {
        Some(s) => StdRng::seed_from_u64(s),
        None    => StdRng::from_entropy(),
    };
    let size = config.sizes.draw(&mut rng)?;
    let sampler = WeightedSegmentSampler::new(&free, size)?;
    info!(size = %sampler.size(), segments = sampler.candidates().count(), "sampling");

    let seeds = (0..cli.trials).map(|_| rng.gen::<u64>()).collect_vec();
    let placements = seeds
        .into_par_iter()
        .map(|s| sampler.sample(&mut StdRng::seed_from_u64(s)).map(|p| p.range))
        .collect::<PoolResult<Vec<_>>>()?;

    let report = placement_spread(&placements, &config.puzzle)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
