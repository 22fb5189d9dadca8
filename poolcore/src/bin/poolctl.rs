use anyhow::Context;
use poolcore::{*, analyze::*, config::parse_length};
use serde_json::{json, Value};

type Pool = AllocationCoordinator<FileStore, FileLock>;

/// Hands out non-overlapping blocks of a puzzle key space to workers
/// sharing one data directory
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the block store and the lock files
    #[arg(short, long, env = "POOL_DATA_DIR", default_value = "pool-data")]
    #[arg(value_parser = clap::value_parser!(PathBuf))]
    data_dir:           PathBuf,

    /// First key of the puzzle (hex)
    #[arg(long, env = "PUZZLE_START_RANGE")]
    start:              String,

    /// One past the last key of the puzzle (hex)
    #[arg(long, env = "PUZZLE_END_RANGE")]
    end:                String,

    /// Smallest block to hand out (e.g. 500M, 1T, 0x1000)
    #[arg(long, env = "BLOCK_RANGE_MIN_KEYS")]
    min_keys:           Option<String>,

    /// Largest block to hand out
    #[arg(long, env = "BLOCK_RANGE_MAX_KEYS")]
    max_keys:           Option<String>,

    /// Hours a worker may keep a block before it is reclaimed
    #[arg(long, env = "BLOCK_TTL_HOURS", default_value_t = 12)]
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    ttl_hours:          u64,

    /// Give up on the allocation lock after this many milliseconds
    #[arg(long, env = "LOCK_TIMEOUT_MS", default_value_t = 2_000)]
    lock_timeout_ms:    u64,

    /// Re-issue expired ranges before drawing fresh ones
    #[arg(long, env = "RECLAIM_EXPIRED")]
    reclaim:            bool,

    #[command(subcommand)]
    cmd:                Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Claim a block for a worker
    Allocate {
        /// Opaque worker identifier
        #[arg(short, long)]
        owner:  String,
        /// Exact block length instead of a random one
        #[arg(short, long)]
        length: Option<String>,
        /// Hand back the worker's live block if it has one
        #[arg(long)]
        resume: bool,
    },
    /// Record an accepted solution for a block
    Complete {
        id:     String,
        /// Whatever the validator accepted; only logged
        #[arg(long, default_value = "")]
        proof:  String,
    },
    /// Give a block back before its deadline
    Release {
        id:     String,
    },
    /// Print one block
    Show {
        id:     String,
    },
    /// Expire every block past its deadline
    Expire,
    /// Print the free segments of the puzzle
    Segments,
    /// Duplicates, overlaps, size statistics and start histogram
    Analyze,
    /// Completion per bin of the puzzle
    Overview {
        /// Defaults to one bin per bit of the puzzle's end
        #[arg(short, long)]
        bins:   Option<usize>,
    },
    /// Blocks touching one bin of the overview
    Bin {
        index:  usize,
        #[arg(short, long)]
        bins:   Option<usize>,
        #[arg(long, default_value_t = 0)]
        skip:   usize,
        #[arg(long, default_value_t = 50)]
        take:   usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Args::parse();
    init_tracing();

    let allocator = AllocatorConfig {
        block_ttl:          block_ttl(cli.ttl_hours)?,
        lock:               LockPolicy {
            timeout:        Duration::from_millis(cli.lock_timeout_ms),
            ..LockPolicy::default()
        },
        reclaim_expired:    cli.reclaim,
    };
    let config = PoolConfig::from_text(
        &cli.start,
        &cli.end,
        cli.min_keys.as_deref(),
        cli.max_keys.as_deref(),
        allocator,
    )?;
    let store = FileStore::open(cli.data_dir.join("blocks.json"))
        .with_context(|| format!("opening store in {}", cli.data_dir.display()))?;
    let lock = FileLock::new(cli.data_dir.join("locks"))?;
    let pool = AllocationCoordinator::new(store, lock, config.allocator.clone());

    let out = run(&pool, &config, cli.cmd)?;
    println!("{}", serde_json::to_string_pretty(&out)?);

    Ok(())
}

fn block_ttl(hours: u64) -> anyhow::Result<Duration> {
    hours.checked_mul(60 * 60)
        .map(Duration::from_secs)
        .with_context(|| format!("a TTL of {hours} hours is out of range"))
}

fn run(pool: &Pool, config: &PoolConfig, cmd: Cmd) -> anyhow::Result<Value> {
    let puzzle = &config.puzzle;
    let out = match cmd {
        Cmd::Allocate { owner, length, resume } => {
            let owner = OwnerToken(owner);
            if resume {
                if let Some(live) = pool.active_for(&owner)? {
                    return Ok(json!({ "resumed": true, "block": live }));
                }
            }
            let request = match length {
                Some(l) => SizeRequest::Exact(parse_length(&l)?),
                None    => SizeRequest::Policy,
            };
            let block = pool.allocate_sized(&owner, puzzle, &config.sizes, &request)
                .map_err(|e| {
                    if e.is_retryable() {
                        anyhow::Error::new(e).context("pool busy, retry later")
                    } else {
                        e.into()
                    }
                })?;
            json!({ "resumed": false, "block": block })
        },
        Cmd::Complete { id, proof } => json!(pool.complete(&BlockId(id), &proof)?),
        Cmd::Release { id }         => json!(pool.release(&BlockId(id))?),
        Cmd::Show { id }            => {
            let id = BlockId(id);
            json!(pool.store().get_block(&id)?.ok_or(PoolError::NotFound(id))?)
        },
        Cmd::Expire                 => json!({ "expired": pool.expire_stale(Utc::now())? }),
        Cmd::Segments               => {
            let free = pool.free_segments(puzzle)?;
            let total: KeyInt = free.iter().map(|s| &s.end - &s.start).sum();
            json!({
                "puzzle":   puzzle,
                "free":     format_key(&total),
                "segments": free.iter()
                    .map(|s| json!({
                        "range":    s,
                        "length":   format_key(&(&s.end - &s.start)),
                    }))
                    .collect_vec(),
            })
        },
        Cmd::Analyze                => json!(summarize(&pool.snapshot()?, puzzle)?),
        Cmd::Overview { bins }      => {
            let bins = bins.unwrap_or_else(|| default_bin_count(puzzle));
            json!({
                "puzzle":   puzzle,
                "bins":     coverage_by_bin(&pool.snapshot()?, puzzle, bins)?,
            })
        },
        Cmd::Bin { index, bins, skip, take } => {
            let bins = bins.unwrap_or_else(|| default_bin_count(puzzle));
            let blocks = pool.snapshot()?;
            let found = blocks_in_bin(&blocks, puzzle, bins, index)?;
            json!({
                "index":    index,
                "range":    split_bins(puzzle, bins)?[index],
                "total":    found.len(),
                "blocks":   found.into_iter().skip(skip).take(take).collect_vec(),
            })
        },
    };

    Ok(out)
}
