//! Administrative inspector for a vos pool file (§6, §A.4): decodes the
//! on-disk header chain without going through the full transactional
//! surface, for operators debugging a pool offline.
//!
//! Argument parsing is grounded on the teacher's `src/bin/cli.rs` (clap
//! derive `Parser`/`Subcommand`); the subcommand set and box-drawing print
//! style are grounded on `src/bin/sombra-inspect.rs`.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use vos::heap::layout::ChunkKind;
use vos::heap::Heap;

#[derive(Parser, Debug)]
#[command(
    name = "vos-inspect",
    version,
    about = "Inspect a vos pool file",
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to the pool file.
    pool: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show pool metadata.
    Info,
    /// Show detailed chunk/zone statistics.
    Stats,
    /// Run an integrity check over the chunk table.
    Verify,
    /// Show raw header field values.
    Header,
    /// Show write-ahead log status.
    WalInfo,
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn print_header(title: &str) {
    let width = 60;
    let padding = (width - title.len() - 2) / 2;
    println!();
    println!("╔{}╗", "═".repeat(width));
    println!(
        "║{}{title}{}║",
        " ".repeat(padding),
        " ".repeat(width - padding - title.len())
    );
    println!("╚{}╝", "═".repeat(width));
    println!();
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(55usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn cmd_info(pool_path: &PathBuf) -> vos::Result<()> {
    print_header("POOL INFO");

    let heap = Heap::open(pool_path)?;
    let pool_header = heap.pool_header()?;
    let heap_header = heap.heap_header()?;
    let zone_header = heap.zone_header()?;

    print_section("General");
    print_field("Pool Path", pool_path.display());
    print_field("Pool Size", format_bytes(pool_header.size));
    print_field("Pool Version", pool_header.version);

    print_section("Heap");
    print_field("Heap Size", format_bytes(heap_header.size));
    print_field("Zones", heap_header.nzones);
    print_field("Zone Layout Bytes", heap_header.zone_layout);

    print_section("Zone 0");
    print_field("Chunk Slots", zone_header.size_idx);
    print_field("Chunks Free", heap.free_chunk_count());
    print_field(
        "Chunks Used",
        heap.nchunks().saturating_sub(heap.free_chunk_count()),
    );

    println!();
    println!("✓ Pool opened successfully");
    println!();

    Ok(())
}

fn cmd_stats(pool_path: &PathBuf) -> vos::Result<()> {
    print_header("POOL STATISTICS");

    let heap = Heap::open(pool_path)?;
    let counts = heap.chunk_kind_counts();

    print_section("Chunk Table");
    print_field("Free", counts[ChunkKind::Free as usize]);
    print_field("Used", counts[ChunkKind::Used as usize]);
    print_field("Run", counts[ChunkKind::Run as usize]);
    print_field("Run Data", counts[ChunkKind::RunData as usize]);
    print_field("Footer", counts[ChunkKind::Footer as usize]);

    print_section("Free Extents");
    let extents = heap.free_extents();
    print_field("Extent Count", extents.len());
    for (i, extent) in extents.iter().enumerate() {
        print_field(
            &format!("  extent[{i}]"),
            format!("zone={} start={} len={}", extent.zone, extent.start, extent.len),
        );
    }

    println!();

    Ok(())
}

fn cmd_verify(pool_path: &PathBuf) -> vos::Result<()> {
    print_header("INTEGRITY VERIFICATION");

    let heap = Heap::open(pool_path)?;
    println!("  Running chunk table checks...");
    println!();

    let counts = heap.chunk_kind_counts();
    let accounted: u32 = counts.iter().sum();
    let expected = heap.nchunks();

    print_section("Verification Results");
    print_field("Chunk Slots Expected", expected);
    print_field("Chunk Slots Decoded", accounted);

    let free_sum: u32 = heap.free_extents().iter().map(|e| e.len).sum();
    print_field("Free Chunks (cache)", free_sum);
    print_field("Free Chunks (table)", counts[ChunkKind::Free as usize]);

    let mismatch = accounted != expected || free_sum != counts[ChunkKind::Free as usize];

    println!();
    if !mismatch {
        println!("  ✓ No issues found - pool is consistent");
        println!();
        println!("  Status: PASS");
    } else {
        println!("  ✗ Found inconsistencies between the chunk table and the free cache");
        println!();
        println!("  Status: FAIL");
    }
    println!();

    Ok(())
}

fn cmd_header(pool_path: &PathBuf) -> vos::Result<()> {
    print_header("RAW HEADER CONTENTS");

    let heap = Heap::open(pool_path)?;
    let pool_header = heap.pool_header()?;
    let heap_header = heap.heap_header()?;
    let zone_header = heap.zone_header()?;

    print_section("PoolHeader");
    print_field("version", pool_header.version);
    print_field("size", pool_header.size);
    print_field("root_off", pool_header.root_off);
    print_field("stats_off", pool_header.stats_off);

    print_section("HeapHeader");
    print_field("size", heap_header.size);
    print_field("nzones", heap_header.nzones);
    print_field("zone_layout", heap_header.zone_layout);

    print_section("ZoneHeader (zone 0)");
    print_field("size_idx", zone_header.size_idx);
    print_field("flags", zone_header.flags);

    println!();

    Ok(())
}

fn cmd_wal_info(pool_path: &PathBuf) -> vos::Result<()> {
    print_header("WAL INFORMATION");

    let heap = Heap::open(pool_path)?;
    let wal_path = heap.wal_path();

    match fs::metadata(&wal_path) {
        Ok(metadata) => {
            let size = metadata.len();

            print_section("WAL Status");
            print_field("WAL File", wal_path.display());
            print_field("WAL Size", format_bytes(size));
            print_field("Status", "Present");

            if size == 0 {
                println!();
                println!("  ℹ WAL file exists but is empty (clean state)");
            } else {
                println!();
                println!("  ⚠ WAL file is non-empty; `Heap::open` replays it eagerly,");
                println!("    so a live pool should never observe this.");
            }
        }
        Err(_) => {
            print_section("WAL Status");
            print_field("WAL File", "Not found");
            print_field("Status", "No active WAL");

            println!();
            println!("  ✓ Pool is in clean state (no WAL)");
        }
    }

    println!();

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Info => cmd_info(&cli.pool),
        Command::Stats => cmd_stats(&cli.pool),
        Command::Verify => cmd_verify(&cli.pool),
        Command::Header => cmd_header(&cli.pool),
        Command::WalInfo => cmd_wal_info(&cli.pool),
    };

    if let Err(e) = result {
        eprintln!();
        eprintln!("╔══════════════════════════════════════════════════════════╗");
        eprintln!("║                         ERROR                            ║");
        eprintln!("╚══════════════════════════════════════════════════════════╝");
        eprintln!();
        eprintln!("  {e}");
        eprintln!();
        process::exit(1);
    }
}
