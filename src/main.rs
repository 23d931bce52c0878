use anyhow::{Context, Result};
use bloksel_chunkstore::sync::install_mode;
use bloksel_chunkstore::world::{BlockId, ChunkStage, CHUNK_SIZE};
use bloksel_chunkstore::{Chunk, ChunkCoord, ChunkSysConfig, StripedChunkMap};
use crossbeam_channel::{bounded, Receiver};
use glam::UVec3;
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use rayon::prelude::*;
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Job {
    Edit {
        coord: ChunkCoord,
        local: UVec3,
        block: BlockId,
    },
    WholeCopy { coord: ChunkCoord },
    Erase { coord: ChunkCoord },
    Iterate,
}

#[derive(Default)]
struct Counters {
    edits: AtomicUsize,
    recreated: AtomicUsize,
    copies: AtomicUsize,
    lock_retries: AtomicUsize,
    erased: AtomicUsize,
    missed: AtomicUsize,
    visited: AtomicUsize,
}

fn random_coord(rng: &mut ChaCha12Rng, radius: i32) -> ChunkCoord {
    ChunkCoord::new(
        rng.gen_range(-radius..=radius),
        rng.gen_range(-radius..=radius),
        rng.gen_range(-radius..=radius),
    )
}

fn random_block(rng: &mut ChaCha12Rng) -> BlockId {
    BlockId(rng.gen_range(1..16))
}

fn populate(map: &StripedChunkMap, config: &ChunkSysConfig) -> usize {
    let total = config.worker_threads * config.chunks_per_worker;
    let created = AtomicUsize::new(0);
    (0..total).into_par_iter().for_each(|i| {
        let mut rng = ChaCha12Rng::seed_from_u64(config.seed ^ (i as u64).wrapping_mul(0x9e37_79b9));
        let coord = random_coord(&mut rng, config.world_radius);
        let (cursor, fresh) = map.create(coord);
        let chunk = cursor.value().cloned();
        // Generation is slow; don't keep other coords of this bucket waiting.
        drop(cursor);
        let Some(chunk) = chunk else { return };
        if fresh && chunk.advance_stage(ChunkStage::Empty, ChunkStage::Generating) {
            let ground = random_block(&mut rng);
            let height = rng.gen_range(0..CHUNK_SIZE);
            for y in 0..height {
                for z in 0..CHUNK_SIZE {
                    for x in 0..CHUNK_SIZE {
                        chunk.set_block(UVec3::new(x, y, z), ground);
                    }
                }
            }
            chunk.set_stage(ChunkStage::Generated);
            created.fetch_add(1, Ordering::Relaxed);
        }
    });
    created.into_inner()
}

fn plan_jobs(config: &ChunkSysConfig, rng: &mut ChaCha12Rng) -> Vec<Job> {
    let total = config.worker_threads * config.chunks_per_worker;
    (0..total)
        .map(|_| {
            let coord = random_coord(rng, config.world_radius);
            if rng.gen_bool(config.whole_chunk_ratio) {
                return Job::WholeCopy { coord };
            }
            match rng.gen_range(0..20) {
                0 => Job::Erase { coord },
                1 => Job::Iterate,
                _ => Job::Edit {
                    coord,
                    local: UVec3::new(
                        rng.gen_range(0..CHUNK_SIZE),
                        rng.gen_range(0..CHUNK_SIZE),
                        rng.gen_range(0..CHUNK_SIZE),
                    ),
                    block: random_block(rng),
                },
            }
        })
        .collect()
}

fn run_job(map: &StripedChunkMap, job: Job, counters: &Counters) -> Result<()> {
    match job {
        Job::Edit { coord, local, block } => {
            let chunk = match map.get(&coord) {
                Some(chunk) => chunk,
                None => {
                    let (cursor, _) = map.create(coord);
                    let chunk = cursor.value().cloned();
                    drop(cursor);
                    counters.recreated.fetch_add(1, Ordering::Relaxed);
                    chunk.context("created chunk vanished from its bucket")?
                }
            };
            chunk.set_block(local, block);
            chunk.advance_stage(ChunkStage::Generated, ChunkStage::Meshed);
            counters.edits.fetch_add(1, Ordering::Relaxed);
        }
        Job::WholeCopy { coord } => {
            let Some(chunk) = map.get(&coord) else {
                counters.missed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            };
            let (snapshot, stats) = chunk.snapshot_with_stats();
            counters.lock_retries.fetch_add(stats.retries, Ordering::Relaxed);
            let copy = Chunk::from_serialized(snapshot)?;
            debug!("copied chunk {} with {} solid blocks", coord, copy.non_air_count());
            counters.copies.fetch_add(1, Ordering::Relaxed);
        }
        Job::Erase { coord } => {
            let cursor = map.find(&coord);
            if cursor.is_end() {
                counters.missed.fetch_add(1, Ordering::Relaxed);
            } else {
                map.erase(cursor);
                counters.erased.fetch_add(1, Ordering::Relaxed);
            }
        }
        Job::Iterate => {
            let mut cursor = map.begin();
            let mut seen = 0;
            while !cursor.is_end() {
                seen += 1;
                cursor.advance();
            }
            counters.visited.fetch_add(seen, Ordering::Relaxed);
        }
    }
    Ok(())
}

fn worker(map: &StripedChunkMap, jobs: Receiver<Job>, counters: &Counters) -> Result<()> {
    for job in jobs.iter() {
        run_job(map, job, counters)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => ChunkSysConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ChunkSysConfig::default(),
    };

    SimpleLogger::new().with_level(config.level_filter()?).init()?;
    install_mode(config.hierarchy_checks)?;
    info!("Starting chunk store stress run with {:?}", config);

    let map: StripedChunkMap = StripedChunkMap::with_capacity(config.bucket_capacity);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads)
        .build()?;

    let started = Instant::now();
    let created = pool.install(|| populate(&map, &config));
    info!(
        "Populated {} chunks in {:?} ({} buckets, longest chain {})",
        created,
        started.elapsed(),
        map.bucket_count(),
        map.max_chain_len()
    );

    let mut rng = ChaCha12Rng::seed_from_u64(config.seed);
    let jobs = plan_jobs(&config, &mut rng);
    let job_count = jobs.len();
    let counters = Counters::default();
    let (sender, receiver) = bounded(config.worker_threads * 4);

    let started = Instant::now();
    thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..config.worker_threads)
            .map(|_| {
                let receiver = receiver.clone();
                let map = &map;
                let counters = &counters;
                s.spawn(move || worker(map, receiver, counters))
            })
            .collect();
        drop(receiver);

        for job in jobs {
            if sender.send(job).is_err() {
                warn!("All workers stopped before the job queue was drained");
                break;
            }
        }
        drop(sender);

        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => anyhow::bail!("stress worker panicked"),
            }
        }
        Ok(())
    })?;

    info!("Ran {} jobs in {:?}", job_count, started.elapsed());
    info!(
        "edits={} recreated={} copies={} lock_retries={} erased={} missed={} visited={}",
        counters.edits.load(Ordering::Relaxed),
        counters.recreated.load(Ordering::Relaxed),
        counters.copies.load(Ordering::Relaxed),
        counters.lock_retries.load(Ordering::Relaxed),
        counters.erased.load(Ordering::Relaxed),
        counters.missed.load(Ordering::Relaxed),
        counters.visited.load(Ordering::Relaxed),
    );
    info!("{} chunks left in the map", map.len());

    Ok(())
}
