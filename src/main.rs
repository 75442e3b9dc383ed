use std::{
    ptr::NonNull,
    thread,
    time::Instant,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use segalloc::{formatted_size, AllocError, SegAllocator, SegAllocatorConfig};

const OPERATIONS_PER_THREAD: usize = 200_000;
const MAX_LIVE_PER_THREAD: usize = 512;

fn stress(alloc: &SegAllocator, seed: u64) -> Result<usize, AllocError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<NonNull<u8>> = Vec::with_capacity(MAX_LIVE_PER_THREAD);
    let max_size = alloc.page_size();
    let mut operations = 0;

    for _ in 0..OPERATIONS_PER_THREAD {
        let roll = rng.gen_range(0..10);

        if live.len() < MAX_LIVE_PER_THREAD && (roll < 5 || live.is_empty()) {
            // mostly small blocks with the occasional big one
            let size = if rng.gen_bool(0.02) {
                rng.gen_range(1..max_size * 2)
            } else {
                rng.gen_range(1..256)
            };
            live.push(alloc.alloc(size, 1)?);
        } else if roll < 8 {
            let ptr = live.swap_remove(rng.gen_range(0..live.len()));
            unsafe { alloc.free(ptr) };
        } else {
            let index = rng.gen_range(0..live.len());
            let size = rng.gen_range(1..1024);
            live[index] = unsafe { alloc.realloc(live[index], size, 1, true)? };
        }

        operations += 1;
    }

    for ptr in live {
        unsafe { alloc.free(ptr) };
    }

    Ok(operations)
}

fn main() {
    env_logger::init();

    let config = SegAllocatorConfig::from_env();
    let alloc = SegAllocator::new(config);
    let threads = num_cpus::get();
    log::info!(target: "segalloc", "stressing {} with {} threads", alloc.config(), threads);

    let start = Instant::now();
    let operations: usize = thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|id| {
                let alloc = &alloc;
                scope.spawn(move || stress(alloc, id as u64))
            })
            .collect();

        workers
            .into_iter()
            .map(|worker| match worker.join() {
                Ok(Ok(operations)) => operations,
                Ok(Err(err)) => {
                    log::error!(target: "segalloc", "worker failed: {}", err);
                    0
                }
                Err(_) => {
                    log::error!(target: "segalloc", "worker panicked");
                    0
                }
            })
            .sum()
    });
    let elapsed = start.elapsed();

    match alloc.check_state() {
        Ok(stats) => {
            println!(
                "{} operations in {:.2?} over {} pages ({} reserved, {} used, {} big blocks)",
                operations,
                elapsed,
                stats.pages,
                formatted_size(stats.pages * alloc.page_size()),
                formatted_size(stats.used_bytes),
                stats.big_blocks
            );
        }
        Err(err) => {
            eprintln!("allocator state is broken: {}", err);
            std::process::exit(1);
        }
    }
}
