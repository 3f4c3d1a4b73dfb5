use std::{process, ptr, thread};

use argh::FromArgs;
use bitslab::{
    AllocError, ConfigError, FreeLocking, HeapBackend, InvalidPointer, MemoryBackend,
    SlabAllocator, SlabConfig, SystemBackend,
};
use snafu::{ResultExt as _, Snafu, ensure};

/// Exercise a bitslab allocator: a short scripted session followed by a
/// multi-threaded stress run.
#[derive(Debug, FromArgs)]
struct Args {
    /// block size in bytes
    #[argh(option, default = "bitslab::BLOCK_SIZE")]
    block_size: usize,
    /// chunk size in bytes
    #[argh(option, default = "bitslab::CHUNK_SIZE")]
    chunk_size: usize,
    /// number of stress threads
    #[argh(option, default = "4")]
    threads: u64,
    /// allocate/deallocate cycles per stress thread
    #[argh(option, default = "100")]
    iterations: u64,
    /// use one free lock per chunk instead of a global one
    #[argh(switch)]
    per_chunk_locking: bool,
    /// take chunk memory from the global heap instead of the OS
    #[argh(switch)]
    heap_backend: bool,
}

#[derive(Debug, Snafu)]
enum DemoError {
    #[snafu(display("invalid allocator configuration"))]
    Config { source: ConfigError },
    #[snafu(display("allocation failed"))]
    Alloc { source: AllocError },
    #[snafu(display("deallocation failed"))]
    Dealloc { source: InvalidPointer },
    #[snafu(display("scenario `{scenario}` failed"))]
    Scenario { scenario: &'static str },
    #[snafu(display(
        "worker {worker} found tag {found:#018x} instead of {expected:#018x} at {addr:#x}"
    ))]
    TagMismatch {
        worker: u64,
        addr: usize,
        expected: u64,
        found: u64,
    },
    #[snafu(display("block size {block_size} cannot hold a 64-bit owner tag"))]
    BlockTooSmall { block_size: usize },
    #[snafu(display("stress thread panicked"))]
    ThreadPanicked,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = snafu::Report::from_error(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), DemoError> {
    let locking = if args.per_chunk_locking {
        FreeLocking::PerChunk
    } else {
        FreeLocking::Global
    };
    let config = SlabConfig::new(args.block_size, args.chunk_size)
        .context(ConfigSnafu)?
        .with_free_locking(locking);
    log::info!(
        "{} blocks of {} bytes per chunk, {locking:?} free locking",
        config.blocks_per_chunk(),
        config.block_size()
    );

    if args.heap_backend {
        run_with(args, SlabAllocator::with_config(config, HeapBackend))
    } else {
        run_with(args, SlabAllocator::with_config(config, SystemBackend::default()))
    }
}

fn run_with<B>(args: &Args, mut allocator: SlabAllocator<B>) -> Result<(), DemoError>
where
    B: MemoryBackend,
{
    let p1 = allocator.allocate().context(AllocSnafu)?;
    println!("p1 ----- {p1:p}");
    let p2 = allocator.allocate().context(AllocSnafu)?;
    println!("p2 ----- {p2:p}");
    allocator.deallocate(p2.as_ptr()).context(DeallocSnafu)?;
    println!("p2 ----- dealloc");

    scenarios(&allocator)?;
    stress(&allocator, args.threads, args.iterations)?;

    allocator.deallocate(p1.as_ptr()).context(DeallocSnafu)?;
    println!("{}", allocator.stats());
    ensure!(
        allocator.stats().used_blocks == 0,
        ScenarioSnafu {
            scenario: "no blocks left in use"
        }
    );

    allocator.cleanup();
    log::info!("released all chunks");
    Ok(())
}

fn scenarios<B>(allocator: &SlabAllocator<B>) -> Result<(), DemoError>
where
    B: MemoryBackend,
{
    let blocks = [
        allocator.allocate().context(AllocSnafu)?,
        allocator.allocate().context(AllocSnafu)?,
        allocator.allocate().context(AllocSnafu)?,
    ];
    ensure!(
        blocks[0] != blocks[1] && blocks[1] != blocks[2] && blocks[0] != blocks[2],
        ScenarioSnafu {
            scenario: "three distinct blocks"
        }
    );
    for block in blocks {
        allocator.deallocate(block.as_ptr()).context(DeallocSnafu)?;
    }
    println!("three blocks ----- ok");

    let first = allocator.allocate().context(AllocSnafu)?;
    allocator.deallocate(first.as_ptr()).context(DeallocSnafu)?;
    let again = allocator.allocate().context(AllocSnafu)?;
    allocator.deallocate(again.as_ptr()).context(DeallocSnafu)?;
    ensure!(
        first == again,
        ScenarioSnafu {
            scenario: "reuse after free"
        }
    );
    println!("reuse ----- ok ({first:p})");

    let before = allocator.stats();
    let invalid = ptr::with_exposed_provenance_mut::<u8>(0x1234_5678);
    ensure!(
        allocator.deallocate(invalid).is_err() && allocator.stats() == before,
        ScenarioSnafu {
            scenario: "invalid pointer is rejected"
        }
    );
    println!("invalid pointer ----- rejected");

    Ok(())
}

fn stress<B>(allocator: &SlabAllocator<B>, threads: u64, iterations: u64) -> Result<(), DemoError>
where
    B: MemoryBackend,
{
    let block_size = allocator.config().block_size();
    ensure!(block_size >= size_of::<u64>(), BlockTooSmallSnafu { block_size });

    thread::scope(|s| {
        let handles = (0..threads)
            .map(|worker| s.spawn(move || stress_worker(allocator, worker, iterations)))
            .collect::<Vec<_>>();
        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .map_err(|_panic| ThreadPanickedSnafu.build())?
        })
    })?;

    println!(
        "stress ----- {threads} thread(s) x {iterations} cycle(s) ok, {}",
        allocator.stats()
    );
    Ok(())
}

fn stress_worker<B>(
    allocator: &SlabAllocator<B>,
    worker: u64,
    iterations: u64,
) -> Result<(), DemoError>
where
    B: MemoryBackend,
{
    for iteration in 0..iterations {
        let expected = (worker << 32) | iteration;
        let block = allocator.allocate().context(AllocSnafu)?;
        // Blocks are only guaranteed to be aligned relative to the chunk
        // base, so the tag is accessed unaligned.
        let tag = block.cast::<u64>();
        unsafe { tag.write_unaligned(expected) };
        thread::yield_now();
        let found = unsafe { tag.read_unaligned() };
        ensure!(
            found == expected,
            TagMismatchSnafu {
                worker,
                addr: block.addr().get(),
                expected,
                found,
            }
        );
        allocator.deallocate(block.as_ptr()).context(DeallocSnafu)?;
    }
    Ok(())
}
