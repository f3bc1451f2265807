//! Walks through the segment allocator with owned and mapped segments.

use std::{fmt::Display, process, ptr::NonNull};

use argh::FromArgs;
use log::{LevelFilter, info};
use sb_allocator::{Config, SegmentAllocator};
use snafu::{OptionExt as _, Report, ResultExt as _, Whatever};

/// Demonstrate the segment allocator.
#[derive(Debug, FromArgs)]
struct Args {
    /// print translation cache statistics after each walk
    #[argh(switch)]
    profile: bool,
    /// run without the allocator lock
    #[argh(switch)]
    unsynchronized: bool,
    /// log every segment operation
    #[argh(switch, short = 'v')]
    verbose: bool,
    #[argh(subcommand)]
    command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Owned(Owned),
    Mapped(Mapped),
}

/// Allocate owned segments, walk them and release one.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "owned")]
struct Owned {}

/// Map a caller-owned buffer between two owned segments.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "mapped")]
struct Mapped {}

fn main() {
    let args: Args = argh::from_env();

    let level = if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(err) = run(&args) {
        eprintln!("{}", Report::from_error(err));
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Whatever> {
    let config = if args.unsynchronized {
        Config::unsynchronized()
    } else {
        Config::new()
    }
    .with_profiling(args.profile);
    info!("lock mode: {}", config.lock_mode());

    match args.command {
        Command::Owned(_) => {
            run_owned(config).whatever_context("owned segment walk failed")?;
        }
        Command::Mapped(_) => {
            run_mapped(config).whatever_context("mapped segment walk failed")?;
        }
    }
    Ok(())
}

fn run_owned(config: Config) -> Result<(), Whatever> {
    let chars = SegmentAllocator::<u8>::with_config(config);
    for count in [1, 3, 5] {
        chars
            .allocate(count)
            .with_whatever_context(|_| format!("failed to allocate {count} chars"))?;
    }
    for (handle, c) in chars.handles().zip(b'a'..) {
        handle.write(c).whatever_context("failed to write char")?;
    }
    let text = chars.to_vec().whatever_context("failed to read chars")?;
    print_line(text.into_iter().map(char::from));
    print_stats(&chars);

    let numbers = SegmentAllocator::<u32>::with_config(config);
    let mut middle = None;
    for count in [2, 4, 3] {
        let handle = numbers
            .allocate(count)
            .with_whatever_context(|_| format!("failed to allocate {count} numbers"))?;
        if count == 4 {
            middle = Some(handle);
        }
    }
    fill_sequence(&numbers)?;
    print_line(numbers.to_vec().whatever_context("failed to read numbers")?);

    let middle = middle.whatever_context("middle segment was not allocated")?;
    numbers
        .deallocate(&middle)
        .whatever_context("failed to release middle segment")?;
    print_line(numbers.to_vec().whatever_context("failed to read numbers")?);
    print_stats(&numbers);

    Ok(())
}

fn run_mapped(config: Config) -> Result<(), Whatever> {
    let mut buffer = vec![0_u32; 4];
    let base = NonNull::new(buffer.as_mut_ptr()).whatever_context("buffer pointer is null")?;

    {
        let numbers = SegmentAllocator::<u32>::with_config(config);
        numbers
            .allocate(2)
            .whatever_context("failed to allocate leading segment")?;
        // SAFETY: `buffer` is not touched until `numbers` is dropped.
        let mapped = unsafe { numbers.mmap(base, buffer.len()) };
        numbers
            .allocate(3)
            .whatever_context("failed to allocate trailing segment")?;

        fill_sequence(&numbers)?;
        print_line(numbers.to_vec().whatever_context("failed to read numbers")?);

        numbers
            .unmap(&mapped)
            .whatever_context("failed to unmap buffer")?;
        print_line(numbers.to_vec().whatever_context("failed to read numbers")?);
        print_stats(&numbers);
    }

    print_line(buffer);
    Ok(())
}

fn fill_sequence(allocator: &SegmentAllocator<u32>) -> Result<(), Whatever> {
    for (handle, value) in allocator.handles().zip(0..) {
        handle
            .write(value)
            .with_whatever_context(|_| format!("failed to write at {:#x}", handle.vaddr()))?;
    }
    Ok(())
}

fn print_line<I>(values: I)
where
    I: IntoIterator,
    I::Item: Display,
{
    let line = values
        .into_iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
}

fn print_stats<T>(allocator: &SegmentAllocator<T>)
where
    T: Copy + Default,
{
    if let Some(stats) = allocator.cache_stats() {
        println!(
            "  cache: {} lookups, {} primary hits, {} secondary hits, {} misses",
            stats.lookups(),
            stats.primary_hits,
            stats.secondary_hits,
            stats.misses
        );
    }
}
