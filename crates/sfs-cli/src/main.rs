#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sfs_block::{FileByteDevice, FsInfo};
use sfs_check::{run_check, CheckOptions};
use sfs_restore::{open_fs, RestoreOptions, Restorer};
use sfs_types::SUPER_MIRROR_MAX;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "salvagefs", about = "SalvageFS — offline checker and file recovery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check an unmounted filesystem image for consistency.
    Check {
        /// Path to the filesystem image or device.
        device: PathBuf,
        /// Use this superblock mirror copy.
        #[arg(short = 's', long = "super", default_value_t = 0)]
        super_mirror: usize,
        /// Try to repair the filesystem (opens the device read-write).
        #[arg(long)]
        repair: bool,
        /// Create a new, empty checksum tree.
        #[arg(long)]
        init_csum_tree: bool,
        /// Reserved.
        #[arg(long)]
        init_extent_tree: bool,
        /// Output the report in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Try to restore files from a damaged filesystem (unmounted).
    Restore {
        /// Path to the filesystem image or device.
        device: PathBuf,
        /// Directory to restore into (not required with --list-roots).
        outdir: Option<PathBuf>,
        /// Restore snapshots as well as subvolumes.
        #[arg(short = 's')]
        snapshots: bool,
        /// Verbose progress output.
        #[arg(short = 'v')]
        verbose: bool,
        /// Ignore errors and keep restoring.
        #[arg(short = 'i')]
        ignore_errors: bool,
        /// Overwrite files that already exist in the target.
        #[arg(short = 'o')]
        overwrite: bool,
        /// Find the first directory objectid instead of the subvolume root.
        #[arg(short = 'd')]
        find_dir: bool,
        /// List the tree roots on the image and exit.
        #[arg(short = 'l', long = "list-roots")]
        list_roots: bool,
        /// Byte offset of the tree root if the default is unreadable.
        #[arg(short = 't', default_value_t = 0)]
        tree_location: u64,
        /// Byte offset of the fs root if the default is unreadable.
        #[arg(short = 'f', default_value_t = 0)]
        fs_location: u64,
        /// Superblock mirror to start from.
        #[arg(short = 'u', default_value_t = 0)]
        super_mirror: usize,
        /// Explicit subvolume objectid to restore from.
        #[arg(short = 'r', default_value_t = 0)]
        root_objectid: u64,
        /// Output the summary in JSON format.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Check {
            device,
            super_mirror,
            repair,
            init_csum_tree,
            init_extent_tree,
            json,
        } => check_cmd(
            &device,
            super_mirror,
            repair,
            init_csum_tree,
            init_extent_tree,
            json,
        ),
        Command::Restore {
            device,
            outdir,
            snapshots,
            verbose,
            ignore_errors,
            overwrite,
            find_dir,
            list_roots,
            tree_location,
            fs_location,
            super_mirror,
            root_objectid,
            json,
        } => restore_cmd(RestoreArgs {
            device,
            outdir,
            snapshots,
            verbose,
            ignore_errors,
            overwrite,
            find_dir,
            list_roots,
            tree_location,
            fs_location,
            super_mirror,
            root_objectid,
            json,
        }),
    };
    match code {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}

// ── check ───────────────────────────────────────────────────────────────────

fn check_cmd(
    device: &PathBuf,
    super_mirror: usize,
    repair: bool,
    init_csum_tree: bool,
    init_extent_tree: bool,
    json: bool,
) -> Result<i32> {
    if super_mirror >= SUPER_MIRROR_MAX {
        bail!("super mirror must be below {SUPER_MIRROR_MAX}");
    }
    let rw = repair || init_csum_tree || init_extent_tree;
    let dev = if rw {
        FileByteDevice::open_rw(device)
            .with_context(|| format!("failed to open {} read-write", device.display()))?
    } else {
        FileByteDevice::open(device)
            .with_context(|| format!("failed to open {}", device.display()))?
    };
    let fs = FsInfo::open(Box::new(dev), super_mirror)
        .with_context(|| format!("could not open file system on {}", device.display()))?;

    eprintln!("Checking filesystem on {}", device.display());
    let opts = CheckOptions {
        repair,
        init_csum_tree,
        init_extent_tree,
    };
    let report = run_check(&fs, &opts).context("check failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize check report")?
        );
    } else {
        print_check_report(&report);
    }
    Ok(i32::from(report.has_errors()))
}

fn print_check_report(report: &sfs_check::CheckReport) {
    if report.extent_mismatches > 0 {
        println!(
            "extent mismatches: {} (repaired {})",
            report.extent_mismatches, report.extent_repaired
        );
    }
    for bg in &report.space_cache_errors {
        println!("free space cache mismatch in block group {bg}");
    }
    for problem in &report.inode_problems {
        println!(
            "root {} inode {} errors {:x} unresolved refs {}",
            problem.root, problem.ino, problem.errors, problem.unresolved_refs
        );
    }
    for problem in &report.root_problems {
        if problem.unreachable {
            println!("fs tree {} not referenced", problem.objectid);
        } else {
            println!(
                "fs tree {} refs {} {}",
                problem.objectid,
                problem.found_ref,
                if problem.found_root_item { "" } else { "not found" }
            );
        }
    }
    if report.csum_errors > 0 {
        println!("csum ranges without extents: {}", report.csum_errors);
    }
    if report.found_old_backref {
        println!(
            "* Found the old mixed backref format; mount read-only, back up \
             your data and re-create the filesystem. *"
        );
    }

    let stats = &report.stats;
    println!("found {} bytes used, errors: {}", stats.bytes_used, report.has_errors());
    println!("total csum bytes: {}", stats.total_csum_bytes);
    println!("total tree bytes: {}", stats.total_btree_bytes);
    println!("total fs tree bytes: {}", stats.total_fs_tree_bytes);
    println!("total extent tree bytes: {}", stats.total_extent_tree_bytes);
    println!("btree space waste bytes: {}", stats.btree_space_waste);
    println!(
        "file data blocks allocated: {}\n referenced {}",
        stats.data_bytes_allocated, stats.data_bytes_referenced
    );
}

// ── restore ─────────────────────────────────────────────────────────────────

struct RestoreArgs {
    device: PathBuf,
    outdir: Option<PathBuf>,
    snapshots: bool,
    verbose: bool,
    ignore_errors: bool,
    overwrite: bool,
    find_dir: bool,
    list_roots: bool,
    tree_location: u64,
    fs_location: u64,
    super_mirror: usize,
    root_objectid: u64,
    json: bool,
}

/// Interactive loop-guard prompt: a cyclically corrupt directory keeps the
/// walker spinning; ask before continuing.
fn ask_to_continue(path: &str) -> bool {
    eprint!("We seem to be looping a lot on {path}, do you want to keep going on? (y/N): ");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y")
}

fn restore_cmd(args: RestoreArgs) -> Result<i32> {
    if args.super_mirror >= SUPER_MIRROR_MAX {
        bail!("super mirror must be below {SUPER_MIRROR_MAX}");
    }
    if args.verbose {
        eprintln!("opening filesystem on {}", args.device.display());
    }

    let opts = RestoreOptions {
        get_snapshots: args.snapshots,
        ignore_errors: args.ignore_errors,
        overwrite: args.overwrite,
        find_dir: args.find_dir,
        super_mirror: args.super_mirror,
        tree_location: args.tree_location,
        fs_location: args.fs_location,
        root_objectid: args.root_objectid,
    };

    let dev = FileByteDevice::open(&args.device)
        .with_context(|| format!("failed to open {}", args.device.display()))?;
    let fs = open_fs(Box::new(dev), &opts)
        .with_context(|| format!("could not open file system on {}", args.device.display()))?;

    let mut restorer = Restorer::new(&fs, opts, Box::new(|path: &str| ask_to_continue(path)))
        .context("could not read the tree root")?;

    if args.list_roots {
        let roots = restorer.list_roots().context("listing roots failed")?;
        if args.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&roots).context("serialize root list")?
            );
        } else {
            for root in roots {
                println!(
                    " tree ({} {} {}) bytenr {} level {}",
                    root.objectid,
                    sfs_types::ITEM_ROOT_ITEM,
                    root.offset,
                    root.bytenr,
                    root.level
                );
            }
        }
        return Ok(0);
    }

    let Some(outdir) = args.outdir else {
        bail!("an output directory is required unless --list-roots is given");
    };
    let summary = restorer
        .run(&outdir)
        .with_context(|| format!("restore into {} failed", outdir.display()))?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize restore summary")?
        );
    } else {
        println!(
            "restored {} files, {} directories ({} skipped, {} snapshots skipped, {} errors ignored)",
            summary.files_restored,
            summary.dirs_created,
            summary.files_skipped,
            summary.snapshots_skipped,
            summary.errors_ignored
        );
    }
    Ok(i32::from(summary.errors_ignored > 0))
}
