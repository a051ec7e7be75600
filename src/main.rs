use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{error, info, warn, Level, LevelFilter};
use repatch::{
    apply_patches, correct_headers, normalize_diff, parse_patches, preview_patches, ApplyOptions,
    ApplyStatus, DirWorkspace, Strategy, MAX_FUZZ,
};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

// --- Main Application Entry Point ---

fn main() {
    let args = Args::parse();

    // All the real logic and error handling lives in `run`.
    if let Err(e) = run(args) {
        // Using {:?} ensures the full error chain from `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    setup_logging(args.verbose);

    // --- Argument Validation ---
    if !args.target_dir.is_dir() {
        return Err(anyhow!(
            "Target directory '{}' not found or is not a directory.",
            args.target_dir.display()
        ));
    }
    if args.fuzz > MAX_FUZZ {
        return Err(anyhow!("Fuzz level must be between 0 and {}.", MAX_FUZZ));
    }

    // --- Input ---
    let raw = read_input(&args.input_file)?;

    // --- Normalize, Parse, Correct ---
    let normalized = normalize_diff(&raw);
    let patches = parse_patches(&normalized.text)?;
    if patches.is_empty() {
        info!("No diff content found in the input.");
        return Ok(());
    }
    let (patches, report) = correct_headers(&patches);
    for c in &report.corrections {
        info!(
            "Corrected hunk {} header for '{}': old {} -> {}, new {} -> {}",
            c.hunk_index,
            c.file.display(),
            c.original_old,
            c.corrected_old,
            c.original_new,
            c.corrected_new
        );
    }

    let options = ApplyOptions::builder()
        .preview(!args.apply)
        .fuzz(args.fuzz)
        .mtime_check(!args.no_mtime_check)
        .mtime_prompt(!args.no_prompt)
        .build();
    let workspace = DirWorkspace::new(&args.target_dir).assume_yes(args.yes);

    // --- Pre-Apply Overview ---
    info!(""); // Vertical spacing for readability
    info!("Found {} file(s) to patch.", patches.len());
    for file_info in preview_patches(&patches, &workspace) {
        info!(
            "  {} ({} hunk(s), +{} -{}){}",
            file_info.file.display(),
            file_info.hunks,
            file_info.changes.additions,
            file_info.changes.deletions,
            if file_info.exists { "" } else { " [new file]" }
        );
    }

    // --- Apply ---
    let results = apply_patches(&patches, &workspace, &options);

    let mut success_count = 0;
    let mut fail_count = 0;
    for result in &results {
        match result.status {
            ApplyStatus::Applied => {
                success_count += 1;
                let tier = result.strategy.unwrap_or(Strategy::Strict);
                let label = if tier == Strategy::Strict {
                    format!("{}", tier)
                } else {
                    format!("{}", tier).yellow().to_string()
                };
                println!(
                    "{} {} ({})",
                    "applied:".green().bold(),
                    result.file.display(),
                    label
                );
                if let Some(diff) = &result.diff {
                    println!("----- Proposed Changes for {} -----", result.file.display());
                    print!("{}", diff);
                    println!("------------------------------------");
                }
            }
            ApplyStatus::Failed => {
                fail_count += 1;
                error!(
                    "--- FAILED to patch {}: {}",
                    result.file.display(),
                    result.reason.as_deref().unwrap_or("unknown reason")
                );
            }
        }
    }

    // --- Final Summary ---
    info!("\n--- Summary ---");
    info!("Successful files: {}", success_count);
    info!("Failed files:     {}", fail_count);
    if !args.apply {
        info!("PREVIEW completed. No files were modified. Re-run with --apply to write.");
    }

    if fail_count > 0 {
        warn!("Review the log for errors. Failed files were left untouched.");
        // Return an error to set a non-zero exit code.
        return Err(anyhow!("Completed with {} failed file(s).", fail_count));
    }

    Ok(())
}

// --- Helper Functions ---

/// Reads the diff text from a file, or from stdin when the path is `-`.
fn read_input(path: &PathBuf) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read diff from stdin")?;
        Ok(buffer)
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file '{}'", path.display()))
    }
}

/// Sets up the global logger with colored level prefixes.
fn setup_logging(verbose: u8) {
    let log_level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vv and higher
    };
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply malformed or imprecise unified diffs, correcting hunk headers and matching content tolerantly.",
    long_about = "Repairs AI-generated diff text (missing context spaces, wrong hunk counts, drifted offsets),\nthen locates each hunk with a strict/shifted/greedy strategy chain. Previews by default."
)]
struct Args {
    /// Path to the diff file, or `-` to read from stdin.
    input_file: PathBuf,
    /// Path to the target directory to apply patches in.
    target_dir: PathBuf,
    /// Write the changes. Without this flag, a preview is printed and no
    /// files are modified.
    #[arg(long, help = "Write the changes instead of previewing them.")]
    apply: bool,
    /// Matching tolerance: the Shifted strategy's search window and the
    /// Greedy strategy's edge-trimming budget. 0 requires exact matches.
    #[arg(short = 'f', long, default_value_t = 2, help = "Matching tolerance (0-3). 0 requires exact matches at exact offsets.")]
    fuzz: u8,
    /// Skip the modification-time conflict check before writing.
    #[arg(long, help = "Skip the modification-time conflict check before writing.")]
    no_mtime_check: bool,
    /// Refuse conflicted files outright instead of prompting.
    #[arg(long, help = "Refuse files that changed on disk instead of prompting.")]
    no_prompt: bool,
    /// Answer yes to every prompt.
    #[arg(short = 'y', long, help = "Answer yes to every prompt.")]
    yes: bool,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, long_help = "Increase logging verbosity.\n-v for debug, -vv for trace.")]
    verbose: u8,
}
