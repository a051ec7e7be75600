//! Applies unified diffs that arrive malformed or imprecise, as AI assistants
//! frequently produce them.
//!
//! `repatch` accepts diff text whose structure cannot be trusted: context
//! lines missing their leading space, hunk headers with wrong line counts,
//! offsets that drifted because the diff was regenerated against stale
//! content, CRLF noise. It repairs the text, recomputes the headers, and then
//! locates each hunk with a fixed chain of matching strategies, from exact to
//! increasingly tolerant:
//!
//! 1. **Strict**: exact content at the declared offset.
//! 2. **Shifted**: exact content within a small window around the declared
//!    offset (the window grows with the configured fuzz level).
//! 3. **Greedy**: whitespace-insensitive content, optionally trimming a few
//!    non-matching context lines off the hunk's edges until the remainder
//!    anchors at a unique location.
//!
//! Every result names the strategy that succeeded, and every failure names
//! the strategies that were tried and why each refused, so an apply is always
//! explainable. A file is either rewritten with all of its hunks applied or
//! left byte-identical; no strategy ever produces a partial write.
//!
//! ## Getting Started
//!
//! The usual flow is [`apply_diff`]: normalize the raw text, parse it,
//! correct the hunk headers, and apply everything against a workspace.
//!
//! ```rust
//! use repatch::{apply_diff, ApplyOptions, ApplyStatus, DirWorkspace, Strategy};
//! use std::fs;
//! use tempfile::tempdir;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempdir()?;
//! fs::write(dir.path().join("greet.txt"), "hello\nworld\n")?;
//!
//! // The context line "world" lost its leading space and the header counts
//! // are wrong. Both are repaired before any matching happens.
//! let diff = "\
//! --- a/greet.txt
//! +++ b/greet.txt
//! @@ -1,9 +1,9 @@
//! -hello
//! +goodbye
//! world
//! ";
//!
//! let workspace = DirWorkspace::new(dir.path());
//! let options = ApplyOptions::builder().preview(false).build();
//! let results = apply_diff(diff, &workspace, &options)?;
//!
//! assert_eq!(results[0].status, ApplyStatus::Applied);
//! assert_eq!(results[0].strategy, Some(Strategy::Strict));
//! let patched = fs::read_to_string(dir.path().join("greet.txt"))?;
//! assert_eq!(patched, "goodbye\nworld\n");
//! # Ok(())
//! # }
//! ```
//!
//! ## The Pipeline
//!
//! Each stage is also public on its own, for callers that want to inspect the
//! intermediate state (for instance to log the corrections that were made):
//!
//! - [`normalize_diff`]: pure, idempotent text repair.
//! - [`parse_patches`]: structural parsing into [`ParsedPatch`] values.
//! - [`correct_headers`]: recomputes declared line counts from hunk content,
//!   returning fresh copies and a [`CorrectionReport`]. The input is never
//!   mutated, so the original patches stay valid for auditing.
//! - [`apply_patches`] / [`preview_patches`]: the orchestrator. Preview
//!   performs no writes and reports per-file statistics; apply folds each
//!   file's hunks through the strategy chain and writes all-or-nothing,
//!   guarded by a modification-time conflict check.
//!
//! ```rust
//! use repatch::{correct_headers, parse_patches};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let patches = parse_patches("--- a/f.txt\n+++ b/f.txt\n@@ -1,5 +1,7 @@\n a\n b\n c\n")?;
//! let (fixed, report) = correct_headers(&patches);
//!
//! assert!(report.corrections_made);
//! assert_eq!(fixed[0].hunks[0].old_lines, 3);
//! assert_eq!(fixed[0].hunks[0].new_lines, 3);
//! // The input patches keep their original (wrong) counts.
//! assert_eq!(patches[0].hunks[0].old_lines, 5);
//! # Ok(())
//! # }
//! ```
//!
//! ## Workspaces
//!
//! The engine never touches the filesystem directly. All I/O goes through the
//! [`Workspace`] trait (read, write, stat, prompt), injected into the
//! orchestrator. [`DirWorkspace`] is the production implementation, rooted at
//! a target directory with path-traversal protection. Tests and embedders can
//! supply their own.
//!
//! ## Feature Flags
//!
//! ### `parallel`
//!
//! - **Enabled by default.**
//! - Processes the files of a multi-file patch set concurrently using
//!   [`rayon`](https://crates.io/crates/rayon). Each file's hunk chain is
//!   independent, and results are still reported in input order; concurrency
//!   is an optimization, the ordering is a contract. Disable with
//!   `default-features = false` for single-threaded targets.
use log::{debug, info, trace, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use similar::udiff::unified_diff;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Highest supported fuzz level.
pub const MAX_FUZZ: u8 = 3;

// --- Error Types ---

/// Errors produced while structurally parsing normalized diff text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Hunks were found without any `---`/`+++` file header, and no path
    /// could be inferred during normalization. The patch is unresolvable.
    #[error("hunk starting on line {line} has no file header (e.g. '--- a/path/to/file')")]
    MissingFileHeader {
        /// 1-based line number of the orphaned `@@` header.
        line: usize,
    },
    /// An `@@` line that does not carry parseable `-old +new` ranges.
    #[error("malformed hunk header on line {line}: '{header}'")]
    MalformedHunkHeader { line: usize, header: String },
}

/// Hard errors raised by a [`Workspace`] while reading or writing files.
///
/// These stop the affected file only; the orchestrator reports them as a
/// failed [`ApplyResult`] and continues with the remaining files.
#[derive(Error, Debug)]
pub enum PatchError {
    /// The patch attempted to reach a path outside the workspace root, e.g.
    /// `--- a/../../etc/passwd`.
    #[error("path '{0}' resolves outside the target directory, refusing")]
    PathTraversal(PathBuf),
    /// The caller lacks permission for the target path.
    #[error("permission denied for path: {path:?}")]
    PermissionDenied { path: PathBuf },
    /// The target path exists but is a directory.
    #[error("target path is a directory, not a file: {path:?}")]
    TargetIsDirectory { path: PathBuf },
    /// Any other I/O failure.
    #[error("I/O error while processing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single strategy declined to place a hunk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    /// The file content at the expected offset does not match the hunk.
    #[error("context mismatch at the expected offset")]
    ContextMismatch,
    /// The hunk's expected offset lies beyond the end of the file.
    #[error("hunk extends past the end of the file")]
    PastEndOfFile,
    /// No exact match within the shift window.
    #[error("no matching context within {0} line(s) of the expected offset")]
    NoShiftedMatch(u8),
    /// No unique anchor was found even after trimming edge context.
    #[error("no unique anchor after trimming up to {0} context line(s) per edge")]
    NoAnchor(u8),
    /// The context matched at several locations and the declared offset did
    /// not single one out.
    #[error("ambiguous match at line indices {0:?}")]
    Ambiguous(Vec<usize>),
    /// The strategy is switched off at the current fuzz level.
    #[error("disabled at fuzz 0")]
    Disabled,
}

/// One strategy's refusal, kept for failure diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: Strategy,
    pub error: StrategyError,
}

/// Diagnostics for a hunk that no strategy could place.
///
/// Lists every strategy that was attempted and why each declined, plus a
/// heuristic classification: `whitespace_only` is set when the hunk's content
/// does exist in the file under whitespace-insensitive comparison (or the
/// change appears to already be present), which usually means formatting
/// drift rather than structural divergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkFailure {
    /// 1-based index of the failing hunk within its patch.
    pub hunk_index: usize,
    /// The strategies that were tried, in chain order.
    pub attempts: Vec<StrategyAttempt>,
    /// True when the failure looks like whitespace-only drift rather than
    /// genuinely diverged content.
    pub whitespace_only: bool,
}

impl fmt::Display for HunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hunk {} failed", self.hunk_index)?;
        for attempt in &self.attempts {
            write!(f, "; {}: {}", attempt.strategy, attempt.error)?;
        }
        if self.whitespace_only {
            write!(f, " (drift appears whitespace-only)")?;
        }
        Ok(())
    }
}

impl std::error::Error for HunkFailure {}

// --- Data Model ---

/// A single block of changes from a unified diff.
///
/// `lines` keeps the raw prefixed lines: `' '` context, `'+'` addition,
/// `'-'` deletion, and the literal `\ No newline at end of file` marker,
/// which is carried but never counted. The declared `old_lines`/`new_lines`
/// come straight from the `@@` header and may be wrong until
/// [`correct_headers`] has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based starting line in the old file, from `@@ -start,count`.
    pub old_start: usize,
    /// Declared old-side line count.
    pub old_lines: usize,
    /// 1-based starting line in the new file, from `+start,count`.
    pub new_start: usize,
    /// Declared new-side line count.
    pub new_lines: usize,
    /// Prefixed hunk body lines.
    pub lines: Vec<String>,
}

impl Hunk {
    /// The lines that must be found in the target file: context and deletion
    /// lines, prefix stripped, markers skipped.
    ///
    /// ```
    /// # use repatch::Hunk;
    /// let hunk = Hunk {
    ///     old_start: 1, old_lines: 2, new_start: 1, new_lines: 2,
    ///     lines: vec![" context".into(), "-deleted".into(), "+added".into()],
    /// };
    /// assert_eq!(hunk.match_block(), vec!["context", "deleted"]);
    /// ```
    pub fn match_block(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.starts_with([' ', '-']))
            .map(|l| &l[1..])
            .collect()
    }

    /// The lines that replace the matched block: context and addition lines,
    /// prefix stripped, markers skipped.
    ///
    /// ```
    /// # use repatch::Hunk;
    /// let hunk = Hunk {
    ///     old_start: 1, old_lines: 2, new_start: 1, new_lines: 2,
    ///     lines: vec![" context".into(), "-deleted".into(), "+added".into()],
    /// };
    /// assert_eq!(hunk.replace_block(), vec!["context", "added"]);
    /// ```
    pub fn replace_block(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.starts_with([' ', '+']))
            .map(|l| &l[1..])
            .collect()
    }

    /// Tallies the real `(old, new)` line counts from the hunk body.
    ///
    /// Context lines count on both sides, deletions only on the old side,
    /// additions only on the new side. `\ No newline` markers never count.
    ///
    /// ```
    /// # use repatch::Hunk;
    /// let hunk = Hunk {
    ///     old_start: 1, old_lines: 5, new_start: 1, new_lines: 7,
    ///     lines: vec![" a".into(), " b".into(), " c".into()],
    /// };
    /// assert_eq!(hunk.recount(), (3, 3));
    /// ```
    pub fn recount(&self) -> (usize, usize) {
        let mut old = 0;
        let mut new = 0;
        for line in &self.lines {
            match line.as_bytes().first() {
                Some(b' ') => {
                    old += 1;
                    new += 1;
                }
                Some(b'-') => old += 1,
                Some(b'+') => new += 1,
                // Marker lines are not content.
                _ => {}
            }
        }
        (old, new)
    }

    /// Number of addition lines.
    pub fn additions(&self) -> usize {
        self.lines.iter().filter(|l| l.starts_with('+')).count()
    }

    /// Number of deletion lines.
    pub fn deletions(&self) -> usize {
        self.lines.iter().filter(|l| l.starts_with('-')).count()
    }

    /// Whether the hunk changes anything at all. Context-only hunks are
    /// skipped by the apply loop.
    pub fn has_changes(&self) -> bool {
        self.lines.iter().any(|l| l.starts_with(['+', '-']))
    }
}

/// All the changes destined for a single file.
///
/// File identity is carried as the raw header names; [`target_path`]
/// derives the relative path by stripping the conventional `a/`/`b/`
/// prefixes. A patch with neither name is unresolvable, and the parser
/// rejects it.
///
/// [`target_path`]: ParsedPatch::target_path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPatch {
    /// Raw name from the `---` header, if present.
    pub old_file_name: Option<String>,
    /// Raw name from the `+++` header, if present.
    pub new_file_name: Option<String>,
    /// The hunks, in the order they appeared.
    pub hunks: Vec<Hunk>,
    /// False when the diff carried a `\ No newline at end of file` marker.
    pub ends_with_newline: bool,
}

impl ParsedPatch {
    /// The relative path this patch targets, with `a/`/`b/` prefixes
    /// stripped. `/dev/null` names (file creation) defer to the other side.
    ///
    /// ```
    /// # use repatch::parse_patches;
    /// let patches = parse_patches("--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hi\n").unwrap();
    /// assert_eq!(patches[0].target_path().unwrap().to_str(), Some("new.txt"));
    /// ```
    pub fn target_path(&self) -> Option<PathBuf> {
        let strip = |name: &str, prefix: &str| -> Option<PathBuf> {
            let name = name.trim();
            if name == "/dev/null" || name == "a/dev/null" || name == "b/dev/null" {
                return None;
            }
            let stripped = name.strip_prefix(prefix).unwrap_or(name);
            Some(PathBuf::from(stripped.trim()))
        };
        self.old_file_name
            .as_deref()
            .and_then(|n| strip(n, "a/"))
            .or_else(|| self.new_file_name.as_deref().and_then(|n| strip(n, "b/")))
    }

    /// Whether this patch creates a file: every hunk is addition-only.
    pub fn is_creation(&self) -> bool {
        !self.hunks.is_empty() && self.hunks.iter().all(|h| h.match_block().is_empty())
    }
}

// --- Options ---

/// Configuration for an apply or preview pass.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// If `true` (the default), no files are written. Results carry a
    /// rendered diff of the proposed changes instead.
    pub preview: bool,
    /// Tolerance level 0..=3. Controls the Shifted strategy's search window
    /// and the Greedy strategy's edge-trimming budget. 0 means exact
    /// matching only.
    pub fuzz: u8,
    /// Compare file modification times between read and write, refusing to
    /// overwrite files that changed underneath the preview.
    pub mtime_check: bool,
    /// When a modification is detected, ask the workspace to confirm before
    /// overwriting. When `false`, conflicts are refused outright.
    pub mtime_prompt: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            preview: true,
            fuzz: 2,
            mtime_check: true,
            mtime_prompt: true,
        }
    }
}

impl ApplyOptions {
    /// Creates a new builder for `ApplyOptions`.
    ///
    /// ```
    /// # use repatch::ApplyOptions;
    /// let options = ApplyOptions::builder().preview(false).fuzz(3).build();
    /// assert!(!options.preview);
    /// assert_eq!(options.fuzz, 3);
    /// ```
    pub fn builder() -> ApplyOptionsBuilder {
        ApplyOptionsBuilder::default()
    }
}

/// A builder for [`ApplyOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptionsBuilder {
    preview: Option<bool>,
    fuzz: Option<u8>,
    mtime_check: Option<bool>,
    mtime_prompt: Option<bool>,
}

impl ApplyOptionsBuilder {
    /// Preview mode: no writes, rendered diffs in the results.
    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Tolerance level; values above [`MAX_FUZZ`] are clamped.
    pub fn fuzz(mut self, fuzz: u8) -> Self {
        self.fuzz = Some(fuzz.min(MAX_FUZZ));
        self
    }

    /// Enable or disable the modification-time conflict check.
    pub fn mtime_check(mut self, check: bool) -> Self {
        self.mtime_check = Some(check);
        self
    }

    /// Whether conflicts prompt for confirmation or are refused outright.
    pub fn mtime_prompt(mut self, prompt: bool) -> Self {
        self.mtime_prompt = Some(prompt);
        self
    }

    /// Builds the `ApplyOptions`.
    pub fn build(self) -> ApplyOptions {
        let default = ApplyOptions::default();
        ApplyOptions {
            preview: self.preview.unwrap_or(default.preview),
            fuzz: self.fuzz.unwrap_or(default.fuzz).min(MAX_FUZZ),
            mtime_check: self.mtime_check.unwrap_or(default.mtime_check),
            mtime_prompt: self.mtime_prompt.unwrap_or(default.mtime_prompt),
        }
    }
}

// --- Results ---

/// The matching tiers, in increasing order of tolerance and decreasing
/// order of confidence. The `Ord` impl reflects that ordering, so the most
/// relaxed tier a file needed is simply the maximum over its hunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strategy {
    /// Exact content at the expected offset.
    Strict,
    /// Exact content within the fuzz window around the expected offset.
    Shifted,
    /// Whitespace-insensitive content with edge-context trimming, anywhere
    /// in the file, anchored uniquely.
    Greedy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Strict => f.write_str("strict"),
            Strategy::Shifted => f.write_str("shifted"),
            Strategy::Greedy => f.write_str("greedy"),
        }
    }
}

/// The fixed strategy order. This is a closed chain, not a plugin registry.
pub const STRATEGY_CHAIN: [Strategy; 3] = [Strategy::Strict, Strategy::Shifted, Strategy::Greedy];

/// Terminal status of one file in an apply pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Applied,
    Failed,
}

/// Per-file outcome of an apply (or preview) invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// Relative path of the target file.
    pub file: PathBuf,
    pub status: ApplyStatus,
    /// Populated only on failure.
    pub reason: Option<String>,
    /// Populated only on success: the most relaxed tier any hunk of this
    /// file needed, so callers can see that a risky fallback was involved.
    pub strategy: Option<Strategy>,
    /// Rendered unified diff of the proposed changes, populated only in
    /// preview mode.
    pub diff: Option<String>,
}

/// Addition/deletion totals for one file, for preview rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileChanges {
    pub additions: usize,
    pub deletions: usize,
}

/// Pre-apply statistics for one file. Produced by [`preview_patches`]
/// before any write occurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Relative path of the target file.
    pub file: PathBuf,
    /// Whether the target currently exists in the workspace.
    pub exists: bool,
    /// Number of hunks aimed at this file.
    pub hunks: usize,
    pub changes: FileChanges,
}

/// One recomputed hunk header, recorded by [`correct_headers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkCorrection {
    /// 1-based index of the hunk within its patch.
    pub hunk_index: usize,
    /// Path of the file the hunk targets.
    pub file: PathBuf,
    pub original_old: usize,
    pub corrected_old: usize,
    pub original_new: usize,
    pub corrected_new: usize,
}

/// Everything [`correct_headers`] changed, for diagnostic logging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CorrectionReport {
    /// True iff `corrections` is non-empty.
    pub corrections_made: bool,
    pub corrections: Vec<HunkCorrection>,
}

// --- Diff Normalization ---

/// The outcome of [`normalize_diff`]: repaired text plus a note of whether
/// the raw input used CRLF line endings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDiff {
    /// LF-only, structurally repaired diff text.
    pub text: String,
    /// True when the raw input contained `\r\n` sequences.
    pub had_crlf: bool,
}

/// Repairs common malformations in raw diff text before structural parsing.
///
/// This is a pure text transform with three jobs:
///
/// - Context lines inside a hunk body that lost their mandatory leading
///   space get it back, but only when they are unambiguously context (not
///   starting with `+`, `-`, `@` or `\`). Empty lines inside a hunk body
///   become a single-space context line.
/// - `\r\n` is folded to `\n`; the return value records that CRLF was seen.
/// - A `diff --git a/X b/Y` header whose `---`/`+++` pair is missing gets a
///   synthetic pair inserted before the first `@@`, so the structural parser
///   can resolve the file. When no path can be inferred at all the text is
///   left alone and the parser reports the orphaned hunk; the path is never
///   guessed.
///
/// Normalizing already-normalized text is a no-op:
///
/// ```
/// # use repatch::normalize_diff;
/// let once = normalize_diff("@@ -1 +1 @@\r\n-old\r\nnew context\r\n");
/// let twice = normalize_diff(&once.text);
/// assert_eq!(once.text, twice.text);
/// ```
pub fn normalize_diff(raw: &str) -> NormalizedDiff {
    let had_crlf = raw.contains("\r\n");
    let text = raw.replace("\r\n", "\n");

    let mut out: Vec<String> = Vec::new();
    // Paths remembered from a `diff --git` line whose ---/+++ pair has not
    // been seen yet.
    let mut pending_git: Option<(String, String)> = None;
    let mut in_hunk_body = false;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            pending_git = split_git_header(rest);
            in_hunk_body = false;
            out.push(line.to_string());
        } else if line.starts_with("--- ") && !in_hunk_body {
            // The file header pair is present; nothing to synthesize.
            pending_git = None;
            out.push(line.to_string());
        } else if line.starts_with("+++ ") && !in_hunk_body {
            out.push(line.to_string());
        } else if line.starts_with("@@") {
            if let Some((old, new)) = pending_git.take() {
                debug!("Synthesizing file headers from 'diff --git {} {}'", old, new);
                out.push(format!("--- {}", old));
                out.push(format!("+++ {}", new));
            }
            in_hunk_body = true;
            out.push(line.to_string());
        } else if in_hunk_body {
            if line.starts_with(['+', '-', ' ', '\\']) {
                out.push(line.to_string());
            } else {
                // A body line with no prefix is a context line that lost its
                // leading space.
                trace!("Re-inserting dropped context space on line: '{}'", line);
                out.push(format!(" {}", line));
            }
        } else {
            out.push(line.to_string());
        }
    }

    let mut normalized = out.join("\n");
    if text.ends_with('\n') {
        normalized.push('\n');
    }
    NormalizedDiff {
        text: normalized,
        had_crlf,
    }
}

/// Splits the remainder of a `diff --git` line into its two path tokens.
fn split_git_header(rest: &str) -> Option<(String, String)> {
    let mut parts = rest.split_whitespace();
    let old = parts.next()?;
    let new = parts.next()?;
    if parts.next().is_some() {
        // Paths with spaces are not worth guessing about.
        return None;
    }
    Some((old.to_string(), new.to_string()))
}

// --- Structural Parsing ---

/// Parses normalized unified-diff text into an ordered list of per-file
/// patches.
///
/// Recognized structure: optional `diff --git` lines, `--- `/`+++ ` file
/// headers, `@@ -start,count +start,count @@` hunk headers, and prefixed
/// body lines. Multiple sections for the same target file are merged into
/// one [`ParsedPatch`] in first-appearance order.
///
/// # Errors
///
/// - [`ParseError::MissingFileHeader`] when hunks appear with no resolvable
///   file identity.
/// - [`ParseError::MalformedHunkHeader`] when an `@@` line carries no
///   parseable ranges.
pub fn parse_patches(text: &str) -> Result<Vec<ParsedPatch>, ParseError> {
    let mut sections: Vec<ParsedPatch> = Vec::new();

    let mut old_name: Option<String> = None;
    let mut new_name: Option<String> = None;
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut hunk: Option<Hunk> = None;
    let mut ends_with_newline = true;
    // Line number of the first orphaned hunk, for error reporting.
    let mut first_hunk_line: Option<usize> = None;

    // Closes the current hunk, if any, into the current section.
    fn flush_hunk(hunk: &mut Option<Hunk>, hunks: &mut Vec<Hunk>) {
        if let Some(h) = hunk.take() {
            if !h.lines.is_empty() {
                hunks.push(h);
            }
        }
    }

    // Closes the current file section.
    #[allow(clippy::too_many_arguments)]
    fn flush_section(
        old_name: &mut Option<String>,
        new_name: &mut Option<String>,
        hunk: &mut Option<Hunk>,
        hunks: &mut Vec<Hunk>,
        ends_with_newline: &mut bool,
        first_hunk_line: &mut Option<usize>,
        sections: &mut Vec<ParsedPatch>,
    ) -> Result<(), ParseError> {
        flush_hunk(hunk, hunks);
        if !hunks.is_empty() {
            let patch = ParsedPatch {
                old_file_name: old_name.take(),
                new_file_name: new_name.take(),
                hunks: std::mem::take(hunks),
                ends_with_newline: std::mem::replace(ends_with_newline, true),
            };
            if patch.target_path().is_none() {
                return Err(ParseError::MissingFileHeader {
                    line: first_hunk_line.unwrap_or(1),
                });
            }
            sections.push(patch);
        }
        *old_name = None;
        *new_name = None;
        *first_hunk_line = None;
        *ends_with_newline = true;
        Ok(())
    }

    let all_lines: Vec<&str> = text.lines().collect();
    for (index, &line) in all_lines.iter().enumerate() {
        let line_no = index + 1;
        if line.starts_with("diff --git ") {
            flush_section(
                &mut old_name,
                &mut new_name,
                &mut hunk,
                &mut hunks,
                &mut ends_with_newline,
                &mut first_hunk_line,
                &mut sections,
            )?;
        } else if let Some(rest) = line.strip_prefix("--- ") {
            // Inside a hunk body, `--- ` is only a file header when a `+++ `
            // line follows. Otherwise it is a deletion whose content begins
            // with `-- ` (an SQL comment, say) and belongs to the hunk.
            let is_header = hunk.is_none()
                || all_lines
                    .get(index + 1)
                    .is_some_and(|next| next.starts_with("+++ "));
            if is_header {
                flush_section(
                    &mut old_name,
                    &mut new_name,
                    &mut hunk,
                    &mut hunks,
                    &mut ends_with_newline,
                    &mut first_hunk_line,
                    &mut sections,
                )?;
                old_name = Some(rest.trim().to_string());
            } else if let Some(h) = hunk.as_mut() {
                h.lines.push(line.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if hunk.is_none() {
                new_name = Some(rest.trim().to_string());
            } else if let Some(h) = hunk.as_mut() {
                // An addition whose content begins with `++ `.
                h.lines.push(line.to_string());
            }
        } else if line.starts_with("@@") {
            flush_hunk(&mut hunk, &mut hunks);
            let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(line)
                .ok_or_else(|| ParseError::MalformedHunkHeader {
                    line: line_no,
                    header: line.to_string(),
                })?;
            first_hunk_line.get_or_insert(line_no);
            hunk = Some(Hunk {
                old_start,
                old_lines,
                new_start,
                new_lines,
                lines: Vec::new(),
            });
        } else if line.starts_with(['+', '-', ' ']) {
            if let Some(h) = hunk.as_mut() {
                h.lines.push(line.to_string());
            }
            // Body lines before any @@ header are stray; skip them.
        } else if line.starts_with('\\') {
            if let Some(h) = hunk.as_mut() {
                h.lines.push(line.to_string());
            }
            ends_with_newline = false;
        }
        // Anything else (index lines, mode lines, prose) is ignored.
    }
    flush_section(
        &mut old_name,
        &mut new_name,
        &mut hunk,
        &mut hunks,
        &mut ends_with_newline,
        &mut first_hunk_line,
        &mut sections,
    )?;

    // Merge repeated sections for the same file, preserving first-appearance
    // order. Later sections just contribute their hunks.
    let mut patches: Vec<ParsedPatch> = Vec::new();
    for section in sections {
        let path = section.target_path();
        if let Some(existing) = patches.iter_mut().find(|p| p.target_path() == path) {
            existing.hunks.extend(section.hunks);
            // A marker in any section means the file ends without a newline.
            existing.ends_with_newline &= section.ends_with_newline;
        } else {
            patches.push(section);
        }
    }

    trace!("Parsed {} patch(es)", patches.len());
    Ok(patches)
}

/// Parses `@@ -old_start[,old_lines] +new_start[,new_lines] @@`.
/// Omitted counts default to 1, per the unified diff format.
fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let parts: Vec<_> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }
    let (old_start, old_lines) = parse_range(parts[1].strip_prefix('-')?)?;
    let (new_start, new_lines) = parse_range(parts[2].strip_prefix('+')?)?;
    Some((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

// --- Hunk Header Correction ---

/// Recomputes each hunk's declared line counts from its actual content.
///
/// Returns corrected deep copies together with a [`CorrectionReport`]
/// describing every discrepancy that was found. The input patches are never
/// mutated, even when corrections are computed, so they remain valid for
/// audit logging. Hunks whose declared counts already match are copied
/// untouched.
pub fn correct_headers(patches: &[ParsedPatch]) -> (Vec<ParsedPatch>, CorrectionReport) {
    let mut corrected: Vec<ParsedPatch> = Vec::with_capacity(patches.len());
    let mut corrections: Vec<HunkCorrection> = Vec::new();

    for patch in patches {
        let file = patch.target_path().unwrap_or_default();
        let mut copy = patch.clone();
        for (i, hunk) in copy.hunks.iter_mut().enumerate() {
            let (old, new) = hunk.recount();
            if old != hunk.old_lines || new != hunk.new_lines {
                debug!(
                    "Correcting hunk {} of '{}': old {} -> {}, new {} -> {}",
                    i + 1,
                    file.display(),
                    hunk.old_lines,
                    old,
                    hunk.new_lines,
                    new
                );
                corrections.push(HunkCorrection {
                    hunk_index: i + 1,
                    file: file.clone(),
                    original_old: hunk.old_lines,
                    corrected_old: old,
                    original_new: hunk.new_lines,
                    corrected_new: new,
                });
                hunk.old_lines = old;
                hunk.new_lines = new;
            }
        }
        corrected.push(copy);
    }

    let report = CorrectionReport {
        corrections_made: !corrections.is_empty(),
        corrections,
    };
    (corrected, report)
}

// --- Strategy Chain ---

/// Where a hunk lands in the target content, and what goes there.
///
/// `length` lines starting at `start_index` are replaced by `replacement`.
/// The replacement can differ from the hunk's literal replace block: the
/// Greedy tier reuses the file's own context lines so a whitespace-tolerant
/// match never reformats untouched lines, and the Shifted tier drops blank
/// context that overhangs the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkPlacement {
    /// 0-based line index where the replacement starts.
    pub start_index: usize,
    /// Number of existing lines consumed.
    pub length: usize,
    /// The lines spliced in.
    pub replacement: Vec<String>,
}

impl Strategy {
    /// Attempts to place `hunk` in `lines`.
    ///
    /// `expected` is the 0-based index where the hunk's declared offset says
    /// the match block should start, already adjusted for previously applied
    /// hunks. Each tier interprets `fuzz` by its own policy: Strict ignores
    /// it, Shifted uses it as a vertical search window, Greedy as an
    /// edge-context trimming budget (and is disabled entirely at 0).
    ///
    /// This is a read-only operation; nothing is modified on failure or
    /// success.
    pub fn locate(
        &self,
        hunk: &Hunk,
        lines: &[String],
        expected: usize,
        fuzz: u8,
    ) -> Result<HunkPlacement, StrategyError> {
        match self {
            Strategy::Strict => locate_strict(hunk, lines, expected),
            Strategy::Shifted => locate_shifted(hunk, lines, expected, fuzz),
            Strategy::Greedy => locate_greedy(hunk, lines, expected, fuzz),
        }
    }
}

/// Exact match at the expected offset, zero tolerance.
fn locate_strict(
    hunk: &Hunk,
    lines: &[String],
    expected: usize,
) -> Result<HunkPlacement, StrategyError> {
    let match_block = hunk.match_block();

    if match_block.is_empty() {
        // Pure insertion: no context to verify, the declared offset is all
        // there is.
        return if expected <= lines.len() {
            trace!("    strict: pure insertion at index {}", expected);
            Ok(HunkPlacement {
                start_index: expected,
                length: 0,
                replacement: owned(&hunk.replace_block()),
            })
        } else {
            Err(StrategyError::PastEndOfFile)
        };
    }

    if expected + match_block.len() > lines.len() {
        return Err(StrategyError::PastEndOfFile);
    }
    let window = &lines[expected..expected + match_block.len()];
    if window.iter().map(String::as_str).eq(match_block.iter().copied()) {
        trace!("    strict: exact match at index {}", expected);
        Ok(HunkPlacement {
            start_index: expected,
            length: match_block.len(),
            replacement: owned(&hunk.replace_block()),
        })
    } else {
        Err(StrategyError::ContextMismatch)
    }
}

/// Exact match within ±fuzz lines of the expected offset. At fuzz 0 this
/// degenerates to the expected offset only, tolerating nothing beyond blank
/// context lines that overhang the end of the file.
fn locate_shifted(
    hunk: &Hunk,
    lines: &[String],
    expected: usize,
    fuzz: u8,
) -> Result<HunkPlacement, StrategyError> {
    let match_block = hunk.match_block();
    if match_block.is_empty() {
        return Err(StrategyError::ContextMismatch);
    }

    // Probe outward from the declared offset: 0, -1, +1, -2, +2, ...
    let mut deltas: Vec<isize> = vec![0];
    for magnitude in 1..=fuzz as isize {
        deltas.push(-magnitude);
        deltas.push(magnitude);
    }

    for delta in deltas {
        let at = expected as isize + delta;
        if at < 0 {
            continue;
        }
        let at = at as usize;
        if let Some((consumed, overhang)) = match_allowing_eof_blanks(lines, at, &match_block) {
            if delta != 0 {
                debug!("    shifted: matched {} line(s) off the declared offset", delta);
            }
            return Ok(HunkPlacement {
                start_index: at,
                length: consumed,
                replacement: drop_trailing_blanks(owned(&hunk.replace_block()), overhang),
            });
        }
    }
    Err(StrategyError::NoShiftedMatch(fuzz))
}

/// Whitespace-insensitive match anywhere in the file, trimming up to `fuzz`
/// context lines from each edge of the hunk until the remainder anchors at
/// a unique location. Deletion lines are never trimmed; discarding one would
/// silently drop a change.
fn locate_greedy(
    hunk: &Hunk,
    lines: &[String],
    expected: usize,
    fuzz: u8,
) -> Result<HunkPlacement, StrategyError> {
    if fuzz == 0 {
        return Err(StrategyError::Disabled);
    }
    let match_block = hunk.match_block();
    if match_block.is_empty() {
        return Err(StrategyError::ContextMismatch);
    }

    // The content lines of the hunk, markers excluded. Edge trimming is only
    // legal over the leading/trailing runs of context lines.
    let body: Vec<&str> = hunk
        .lines
        .iter()
        .filter(|l| l.starts_with([' ', '+', '-']))
        .map(String::as_str)
        .collect();
    let budget = fuzz as usize;
    let max_lead = body
        .iter()
        .take_while(|l| l.starts_with(' '))
        .count()
        .min(budget);
    let max_tail = body
        .iter()
        .rev()
        .take_while(|l| l.starts_with(' '))
        .count()
        .min(budget);

    // Least trimming first; a fuller block is a stronger anchor.
    for total in 0..=(max_lead + max_tail) {
        for lead in 0..=total.min(max_lead) {
            let tail = total - lead;
            if tail > max_tail || lead + tail >= match_block.len() {
                continue;
            }
            let candidate = &match_block[lead..match_block.len() - tail];
            let matches = find_trim_matches(lines, candidate);
            match matches.len() {
                0 => continue,
                1 => {
                    let at = matches[0];
                    debug!(
                        "    greedy: anchored at index {} (trimmed {} leading, {} trailing context line(s))",
                        at, lead, tail
                    );
                    return Ok(HunkPlacement {
                        start_index: at,
                        length: candidate.len(),
                        replacement: greedy_replacement(&body, lead, tail, lines, at),
                    });
                }
                _ => {
                    // Several candidates; the declared offset decides, if it
                    // can.
                    let target = expected + lead;
                    let mut best: Option<usize> = None;
                    let mut best_distance = usize::MAX;
                    let mut tie = false;
                    for &m in &matches {
                        let distance = m.abs_diff(target);
                        if distance < best_distance {
                            best_distance = distance;
                            best = Some(m);
                            tie = false;
                        } else if distance == best_distance {
                            tie = true;
                        }
                    }
                    if tie {
                        return Err(StrategyError::Ambiguous(matches));
                    }
                    let at = best.unwrap_or(0);
                    debug!(
                        "    greedy: {} candidates, offset hint selected index {}",
                        matches.len(),
                        at
                    );
                    return Ok(HunkPlacement {
                        start_index: at,
                        length: candidate.len(),
                        replacement: greedy_replacement(&body, lead, tail, lines, at),
                    });
                }
            }
        }
    }
    Err(StrategyError::NoAnchor(fuzz))
}

fn owned(block: &[&str]) -> Vec<String> {
    block.iter().map(|s| s.to_string()).collect()
}

/// Compares `block` against `lines` starting at `at`, exactly. Block lines
/// that overhang the end of the file are tolerated only when blank. Returns
/// `(consumed, overhang)` on a match.
fn match_allowing_eof_blanks(
    lines: &[String],
    at: usize,
    block: &[&str],
) -> Option<(usize, usize)> {
    if at > lines.len() {
        return None;
    }
    let consumed = block.len().min(lines.len() - at);
    for k in 0..consumed {
        if lines[at + k] != block[k] {
            return None;
        }
    }
    if block[consumed..].iter().any(|l| !l.trim().is_empty()) {
        return None;
    }
    Some((consumed, block.len() - consumed))
}

/// Drops up to `count` trailing blank lines from a replacement, mirroring
/// blank context that overhung the end of the file.
fn drop_trailing_blanks(mut replacement: Vec<String>, mut count: usize) -> Vec<String> {
    while count > 0 {
        match replacement.last() {
            Some(last) if last.trim().is_empty() => {
                replacement.pop();
                count -= 1;
            }
            _ => break,
        }
    }
    replacement
}

/// All window positions where `block` matches `lines` under per-line
/// whitespace-trimmed comparison.
fn find_trim_matches(lines: &[String], block: &[&str]) -> Vec<usize> {
    if block.is_empty() || block.len() > lines.len() {
        return Vec::new();
    }
    (0..=lines.len() - block.len())
        .filter(|&i| {
            block
                .iter()
                .enumerate()
                .all(|(k, b)| lines[i + k].trim() == b.trim())
        })
        .collect()
}

/// Builds the replacement for a greedy match. Context lines are taken from
/// the file itself (not the hunk) so a whitespace-tolerant match never
/// reformats lines the patch did not change.
fn greedy_replacement(
    body: &[&str],
    lead: usize,
    tail: usize,
    lines: &[String],
    window_start: usize,
) -> Vec<String> {
    let mut replacement = Vec::new();
    let mut file_pos = window_start;
    for line in &body[lead..body.len() - tail] {
        match line.as_bytes().first() {
            Some(b' ') => {
                replacement.push(lines[file_pos].clone());
                file_pos += 1;
            }
            Some(b'-') => {
                file_pos += 1;
            }
            Some(b'+') => {
                replacement.push(line[1..].to_string());
            }
            _ => {}
        }
    }
    replacement
}

// --- In-Memory Application ---

/// The outcome of folding a patch's hunks over in-memory content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedLines {
    /// The content with every hunk applied.
    pub lines: Vec<String>,
    /// The strategy each change-bearing hunk needed, in application order.
    pub strategies: Vec<Strategy>,
}

impl PatchedLines {
    /// The most relaxed strategy any hunk needed. A patch with no
    /// change-bearing hunks reports [`Strategy::Strict`].
    pub fn strategy(&self) -> Strategy {
        self.strategies
            .iter()
            .copied()
            .max()
            .unwrap_or(Strategy::Strict)
    }

    /// Joins the lines back into file content, with or without a trailing
    /// newline.
    pub fn into_content(self, ends_with_newline: bool) -> String {
        let mut content = self.lines.join("\n");
        if ends_with_newline && !content.is_empty() {
            content.push('\n');
        }
        content
    }
}

/// Applies every hunk of a patch to in-memory lines, all-or-nothing.
///
/// Hunks are applied in ascending `old_start` order. Declared offsets are
/// relative to the pre-edit file, so a cumulative line-count delta from
/// earlier hunks adjusts each subsequent hunk's expected position. Each hunk
/// runs through the strategy chain in fixed order, stopping at the first
/// success.
///
/// # Errors
///
/// The first hunk that every strategy declines aborts the whole patch with a
/// [`HunkFailure`] naming each attempt; the caller's original content is
/// untouched and no partial result escapes.
pub fn apply_hunks_to_lines<T: AsRef<str>>(
    hunks: &[Hunk],
    original: &[T],
    fuzz: u8,
) -> Result<PatchedLines, HunkFailure> {
    let mut lines: Vec<String> = original.iter().map(|l| l.as_ref().to_string()).collect();
    let mut strategies = Vec::new();
    let mut delta: isize = 0;

    let mut order: Vec<usize> = (0..hunks.len()).collect();
    order.sort_by_key(|&i| hunks[i].old_start);

    for index in order {
        let hunk = &hunks[index];
        if !hunk.has_changes() {
            debug!("  Skipping hunk {} (no changes)", index + 1);
            continue;
        }

        // A pure insertion's old_start names the line to insert *after*;
        // otherwise it names the first matched line (1-based).
        let base = if hunk.match_block().is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let expected = (base as isize + delta).clamp(0, lines.len() as isize) as usize;
        trace!(
            "  Hunk {}: declared start {}, cumulative delta {}, expecting index {}",
            index + 1,
            hunk.old_start,
            delta,
            expected
        );

        let mut attempts = Vec::new();
        let mut applied = false;
        for strategy in STRATEGY_CHAIN {
            match strategy.locate(hunk, &lines, expected, fuzz) {
                Ok(placement) => {
                    delta += placement.replacement.len() as isize - placement.length as isize;
                    let end = placement.start_index + placement.length;
                    lines.splice(placement.start_index..end, placement.replacement);
                    strategies.push(strategy);
                    applied = true;
                    break;
                }
                Err(error) => attempts.push(StrategyAttempt { strategy, error }),
            }
        }

        if !applied {
            let whitespace_only = looks_whitespace_only(&lines, hunk);
            return Err(HunkFailure {
                hunk_index: index + 1,
                attempts,
                whitespace_only,
            });
        }
    }

    Ok(PatchedLines { lines, strategies })
}

/// Failure classification heuristic: the old content exists modulo
/// whitespace, or the new content is already present (the change may have
/// been applied before). Either way the divergence is not structural.
fn looks_whitespace_only(lines: &[String], hunk: &Hunk) -> bool {
    !find_trim_matches(lines, &hunk.match_block()).is_empty()
        || !find_trim_matches(lines, &hunk.replace_block()).is_empty()
}

// --- Workspace Collaborator ---

/// Answer to a yes/no workspace prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    Yes,
    No,
}

/// The engine's only door to the outside world.
///
/// The orchestrator receives a `Workspace` by injection and performs no I/O
/// of its own: reading file snapshots, writing results, re-statting for the
/// modification guard, and asking the user to confirm an overwrite all go
/// through this trait. [`DirWorkspace`] is the filesystem implementation;
/// tests and embedders (editors, services) supply their own.
pub trait Workspace {
    /// Reads a file's current content and its modification time snapshot.
    fn read(&self, path: &Path) -> Result<(String, SystemTime), PatchError>;
    /// Writes new content for a file, creating parent directories as needed.
    fn write(&self, path: &Path, content: &str) -> Result<(), PatchError>;
    /// Re-stats a file's modification time.
    fn stat(&self, path: &Path) -> Result<SystemTime, PatchError>;
    /// Whether the path currently exists as a file.
    fn exists(&self, path: &Path) -> bool;
    /// Asks a yes/no question, e.g. to confirm overwriting a conflicted file.
    fn prompt(&self, question: &str) -> PromptChoice;
}

/// A [`Workspace`] rooted at a directory on disk.
///
/// All patch paths are resolved relative to the root and are rejected if
/// they would escape it (`--- a/../../etc/passwd` style patches). Prompts go
/// to the terminal; [`assume_yes`](DirWorkspace::assume_yes) answers them
/// automatically for non-interactive use.
#[derive(Debug)]
pub struct DirWorkspace {
    root: PathBuf,
    assume_yes: bool,
    // One question at a time, even when files are processed in parallel.
    prompt_lock: std::sync::Mutex<()>,
}

impl DirWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            assume_yes: false,
            prompt_lock: std::sync::Mutex::new(()),
        }
    }

    /// Answer every prompt with yes instead of asking.
    pub fn assume_yes(mut self, yes: bool) -> Self {
        self.assume_yes = yes;
        self
    }

    /// Resolves a relative patch path against the root, refusing anything
    /// that climbs out of it. Purely lexical; no filesystem access.
    fn resolve(&self, path: &Path) -> Result<PathBuf, PatchError> {
        use std::path::Component;
        let mut depth: isize = 0;
        for component in path.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(PatchError::PathTraversal(path.to_path_buf()));
                    }
                }
                // Absolute patch paths are never trusted.
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PatchError::PathTraversal(path.to_path_buf()));
                }
            }
        }
        Ok(self.root.join(path))
    }
}

impl Workspace for DirWorkspace {
    fn read(&self, path: &Path) -> Result<(String, SystemTime), PatchError> {
        let full = self.resolve(path)?;
        let content =
            std::fs::read_to_string(&full).map_err(|e| map_io_error(full.clone(), e))?;
        let mtime = std::fs::metadata(&full)
            .and_then(|m| m.modified())
            .map_err(|e| map_io_error(full, e))?;
        Ok((content, mtime))
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), PatchError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| map_io_error(parent.to_path_buf(), e))?;
        }
        std::fs::write(&full, content).map_err(|e| map_io_error(full, e))
    }

    fn stat(&self, path: &Path) -> Result<SystemTime, PatchError> {
        let full = self.resolve(path)?;
        std::fs::metadata(&full)
            .and_then(|m| m.modified())
            .map_err(|e| map_io_error(full, e))
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    fn prompt(&self, question: &str) -> PromptChoice {
        if self.assume_yes {
            return PromptChoice::Yes;
        }
        let _guard = self.prompt_lock.lock().unwrap_or_else(|e| e.into_inner());
        use std::io::Write as _;
        eprint!("{} [y/N] ", question);
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return PromptChoice::No;
        }
        if answer.trim().eq_ignore_ascii_case("y") || answer.trim().eq_ignore_ascii_case("yes") {
            PromptChoice::Yes
        } else {
            PromptChoice::No
        }
    }
}

/// Converts a `std::io::Error` into a more specific `PatchError`.
fn map_io_error(path: PathBuf, e: std::io::Error) -> PatchError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => PatchError::PermissionDenied { path },
        std::io::ErrorKind::IsADirectory => PatchError::TargetIsDirectory { path },
        _ => PatchError::Io { path, source: e },
    }
}

// --- File Modification Guard ---

/// The guard's verdict for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardDecision {
    /// The file changed between read and write time.
    pub modified: bool,
    /// The write may go ahead.
    pub proceed: bool,
}

/// Detects whether a target file changed between the time its snapshot was
/// read and the time it is about to be written.
///
/// - With `mtime_check` disabled the guard always proceeds, comparing
///   nothing.
/// - Matching modification times proceed without prompting.
/// - Differing times prompt the workspace when `mtime_prompt` is set;
///   otherwise the write is refused outright.
/// - Errors while re-statting are logged and treated as advisory: the guard
///   proceeds rather than blocking the workflow on a transient failure.
///
/// `snapshot` is `None` for files that did not exist at read time (file
/// creation); the appearance of such a file since then counts as a
/// modification.
pub fn check_modification<W: Workspace + ?Sized>(
    workspace: &W,
    path: &Path,
    snapshot: Option<SystemTime>,
    options: &ApplyOptions,
) -> GuardDecision {
    if !options.mtime_check {
        return GuardDecision {
            modified: false,
            proceed: true,
        };
    }

    let current = if workspace.exists(path) {
        match workspace.stat(path) {
            Ok(mtime) => Some(mtime),
            Err(e) => {
                warn!(
                    "Could not re-stat '{}' ({}); proceeding anyway",
                    path.display(),
                    e
                );
                return GuardDecision {
                    modified: false,
                    proceed: true,
                };
            }
        }
    } else {
        None
    };

    let modified = match (snapshot, current) {
        (Some(read_time), Some(now)) => read_time != now,
        (None, None) => false,
        // The file appeared, or vanished, since it was read.
        _ => true,
    };
    if !modified {
        return GuardDecision {
            modified: false,
            proceed: true,
        };
    }

    if !options.mtime_prompt {
        debug!(
            "'{}' was modified externally and prompting is off; refusing",
            path.display()
        );
        return GuardDecision {
            modified: true,
            proceed: false,
        };
    }
    let question = format!(
        "'{}' changed on disk since it was read. Overwrite anyway?",
        path.display()
    );
    let proceed = workspace.prompt(&question) == PromptChoice::Yes;
    GuardDecision {
        modified: true,
        proceed,
    }
}

// --- Apply Orchestrator ---

/// Reports per-file statistics before any write occurs: existence, hunk
/// count, and addition/deletion totals. Read-only; missing files are
/// reported with `exists: false` rather than skipped, so callers can decide
/// whether the whole set is inapplicable or only part of it.
pub fn preview_patches<W: Workspace + ?Sized>(
    patches: &[ParsedPatch],
    workspace: &W,
) -> Vec<FileInfo> {
    patches
        .iter()
        .map(|patch| {
            let file = patch.target_path().unwrap_or_default();
            let mut changes = FileChanges::default();
            for hunk in &patch.hunks {
                changes.additions += hunk.additions();
                changes.deletions += hunk.deletions();
            }
            FileInfo {
                exists: workspace.exists(&file),
                hunks: patch.hunks.len(),
                changes,
                file,
            }
        })
        .collect()
}

/// Applies a single file's patch against the workspace.
///
/// The full per-file sequence: resolve the target path, read the current
/// snapshot (or start empty for a creation patch), fold the hunks through
/// the strategy chain, then either render a preview diff or write the result
/// behind the modification guard. A hunk failure aborts the file before
/// anything is written; the target stays byte-identical.
pub fn apply_patch<W: Workspace + ?Sized>(
    patch: &ParsedPatch,
    workspace: &W,
    options: &ApplyOptions,
) -> ApplyResult {
    let Some(file) = patch.target_path() else {
        return failed(PathBuf::new(), "missing file identity");
    };
    info!("Applying patch to: {}", file.display());

    let exists = workspace.exists(&file);
    let (original, snapshot, had_crlf) = if exists {
        match workspace.read(&file) {
            Ok((content, mtime)) => {
                let had_crlf = content.contains("\r\n");
                (content.replace("\r\n", "\n"), Some(mtime), had_crlf)
            }
            Err(e) => return failed(file, &e.to_string()),
        }
    } else if patch.is_creation() {
        info!("  Target does not exist; treating as file creation.");
        (String::new(), None, false)
    } else {
        return failed(file, "file not found");
    };

    let original_lines: Vec<&str> = original.lines().collect();
    let patched = match apply_hunks_to_lines(&patch.hunks, &original_lines, options.fuzz) {
        Ok(patched) => patched,
        Err(failure) => {
            warn!("  {}: {}", file.display(), failure);
            return failed(file, &failure.to_string());
        }
    };

    let strategy = patched.strategy();
    // The diff's `\ No newline` marker removes the trailing newline; absent
    // the marker, the original file's EOF state is preserved.
    let keep_newline =
        patch.ends_with_newline && (original.is_empty() || original.ends_with('\n'));
    let new_content = patched.into_content(keep_newline);

    if options.preview {
        let diff_text = unified_diff(
            similar::Algorithm::default(),
            &original,
            &new_content,
            3,
            Some(("a", "b")),
        );
        return ApplyResult {
            file,
            status: ApplyStatus::Applied,
            reason: None,
            strategy: Some(strategy),
            diff: Some(diff_text.to_string()),
        };
    }

    let decision = check_modification(workspace, &file, snapshot, options);
    if decision.modified && !decision.proceed {
        return failed(file, "file modified externally");
    }

    let disk_content = if had_crlf {
        new_content.replace('\n', "\r\n")
    } else {
        new_content
    };
    match workspace.write(&file, &disk_content) {
        Ok(()) => {
            info!("  Wrote '{}' ({})", file.display(), strategy);
            ApplyResult {
                file,
                status: ApplyStatus::Applied,
                reason: None,
                strategy: Some(strategy),
                diff: None,
            }
        }
        Err(e) => failed(file, &e.to_string()),
    }
}

/// Applies a multi-file patch set against the workspace.
///
/// Files are independent of one another and may be processed concurrently
/// (the `parallel` feature); results are always reported in input order.
/// One file's failure (including a declined modification prompt) abandons
/// only that file; the rest proceed.
pub fn apply_patches<W: Workspace + Sync + ?Sized>(
    patches: &[ParsedPatch],
    workspace: &W,
    options: &ApplyOptions,
) -> Vec<ApplyResult> {
    info!(
        "Applying {} patch(es){}",
        patches.len(),
        if options.preview { " (preview)" } else { "" }
    );

    #[cfg(feature = "parallel")]
    let results: Vec<ApplyResult> = patches
        .par_iter()
        .map(|patch| apply_patch(patch, workspace, options))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let results: Vec<ApplyResult> = patches
        .iter()
        .map(|patch| apply_patch(patch, workspace, options))
        .collect();

    results
}

/// The front door: normalizes raw diff text, parses it, corrects the hunk
/// headers (logging every correction), and applies the result.
///
/// # Errors
///
/// Only structural problems surface as an `Err`: text that cannot be parsed
/// or hunks with no file identity. Everything downstream is reported per
/// file inside the returned [`ApplyResult`]s.
pub fn apply_diff<W: Workspace + Sync + ?Sized>(
    raw: &str,
    workspace: &W,
    options: &ApplyOptions,
) -> Result<Vec<ApplyResult>, ParseError> {
    let normalized = normalize_diff(raw);
    if normalized.had_crlf {
        debug!("Input diff used CRLF line endings");
    }
    let patches = parse_patches(&normalized.text)?;
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
    Ok(apply_patches(&patches, workspace, options))
}

fn failed(file: PathBuf, reason: &str) -> ApplyResult {
    ApplyResult {
        file,
        status: ApplyStatus::Failed,
        reason: Some(reason.to_string()),
        strategy: None,
        diff: None,
    }
}
