//! CSV Sanitizer
//!
//! Turns an irregular, delimited CSV of records into a canonical binary file:
//! records at one constant key step, in non-decreasing key order, with every
//! missing grid position materialized as a null (invalid) record.
//!
//! # Pipeline
//!
//! ```text
//!   <stem>.csv
//!       │  pass 1: bootstrap positive deltas → regular step = min(sample)
//!       │  pass 2: anchor/lookahead scan, gap fill, duplicate collapse
//!       ▼
//!   <stem>.bin            (raw canonical grid)
//!       │  copy + causal normalizer (only when norm_window > 0)
//!       ▼
//!   <stem>.normW<W>.bin   (rolling z-scores, same keys and count)
//! ```
//!
//! # Failure policy
//!
//! The canonical grid is a correctness invariant. Negative deltas, step ratios
//! off the integer grid, non-finite ratios, gap-fill overflow and malformed
//! numeric fields abort the pass with file/line/value context. Artifacts are
//! written to a temporary sibling and renamed into place only on success.
//!
//! # Idempotence
//!
//! Each artifact is rebuilt only when missing, older than its source, or when a
//! rebuild is forced. A forced rebuild of unchanged input is byte-identical.

use crate::dataset::config::SanitizeConfig;
use crate::dataset::normalize::{normalize, StatsWindow};
use crate::dataset::record::Record;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const NORM_MARKER: &str = ".normW";
const BIN_EXT: &str = ".bin";

// =============================================================================
// ARTIFACT NAMING
// =============================================================================

/// `<dir>/<stem>.bin` for a source CSV `<dir>/<stem>.<ext>`.
pub fn raw_path(csv_path: &Path) -> PathBuf {
    csv_path.with_extension("bin")
}

/// `<dir>/<stem>.normW<window>.bin` for a raw file `<dir>/<stem>.bin`.
pub fn norm_path(raw_path: &Path, window: usize) -> PathBuf {
    let stem = raw_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    raw_path.with_file_name(format!("{}{}{}{}", stem, NORM_MARKER, window, BIN_EXT))
}

/// Window encoded in a `.normW<window>.bin` file name, if the name matches strictly.
pub fn parse_norm_window(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let body = name.strip_suffix(BIN_EXT)?;
    let at = body.rfind(NORM_MARKER)?;
    if at == 0 {
        return None;
    }
    let digits = &body[at + NORM_MARKER.len()..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<usize>().ok().filter(|w| *w >= 1)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn modified(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(
            meta.modified()
                .with_context(|| format!("reading mtime of {}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("stat {}", path.display())),
    }
}

/// A target is stale when missing or strictly older than its source.
pub fn is_stale(target: &Path, source: &Path) -> Result<bool> {
    let Some(target_time) = modified(target)? else {
        return Ok(true);
    };
    let source_time = modified(source)?
        .with_context(|| format!("source file missing: {}", source.display()))?;
    Ok(target_time < source_time)
}

// =============================================================================
// CSV SCAN
// =============================================================================

/// Counters for one sanitize pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SanitizeReport {
    pub lines_read: u64,
    pub records_parsed: u64,
    pub unparsable_lines: u64,
    pub invalid_lines: u64,
    pub duplicates_collapsed: u64,
    pub gaps_filled: u64,
    pub records_written: u64,
    pub step: f64,
    pub leftmost_key: f64,
    pub rightmost_key: f64,
}

/// Streams valid records out of a CSV, skipping (and counting) the rest.
struct CsvScanner<R: Record> {
    path: PathBuf,
    reader: BufReader<File>,
    line: String,
    line_no: usize,
    delimiter: char,
    progress_every: u64,
    lines_read: u64,
    records_parsed: u64,
    unparsable: u64,
    invalid: u64,
    _record: PhantomData<R>,
}

impl<R: Record> CsvScanner<R> {
    fn open(path: &Path, cfg: &SanitizeConfig) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening CSV {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: String::new(),
            line_no: 0,
            delimiter: cfg.delimiter,
            progress_every: cfg.progress_every.max(1),
            lines_read: 0,
            records_parsed: 0,
            unparsable: 0,
            invalid: 0,
            _record: PhantomData,
        })
    }

    /// Next valid record with its 1-based line number.
    fn next_valid(&mut self) -> Result<Option<(usize, R)>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .with_context(|| {
                    format!("{}:{}: read error", self.path.display(), self.line_no + 1)
                })?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            self.lines_read += 1;
            if self.lines_read % self.progress_every == 0 {
                info!(
                    path = %self.path.display(),
                    lines = self.lines_read,
                    records = self.records_parsed,
                    "sanitize progress"
                );
            }

            let parsed = R::from_csv(&self.line, self.delimiter, self.line_no)
                .with_context(|| format!("{}: fatal parse error", self.path.display()))?;
            match parsed {
                None => {
                    if !self.line.trim().is_empty() {
                        if self.unparsable == 0 {
                            warn!(
                                path = %self.path.display(),
                                line = self.line_no,
                                content = %self.line.trim(),
                                "skipping unparsable line"
                            );
                        }
                        self.unparsable += 1;
                    }
                }
                Some(record) if !record.is_valid() => {
                    if self.invalid == 0 {
                        warn!(
                            path = %self.path.display(),
                            line = self.line_no,
                            content = %self.line.trim(),
                            "skipping invalid record (further occurrences are counted only)"
                        );
                    }
                    self.invalid += 1;
                }
                Some(record) => {
                    self.records_parsed += 1;
                    return Ok(Some((self.line_no, record)));
                }
            }
        }
    }
}

/// Infer the regular step: the minimum of up to `bootstrap_deltas` positive,
/// non-duplicate key deltas between consecutive valid records.
pub fn infer_step<R: Record>(csv_path: &Path, cfg: &SanitizeConfig) -> Result<f64> {
    let mut scanner = CsvScanner::<R>::open(csv_path, cfg)?;
    let mut prev: Option<f64> = None;
    let mut sampled = 0usize;
    let mut step = f64::INFINITY;

    while sampled < cfg.bootstrap_deltas {
        let Some((_, record)) = scanner.next_valid()? else {
            break;
        };
        let key = record.key_value();
        if let Some(p) = prev {
            let delta = key - p;
            if delta.is_finite() && delta > cfg.abs_tolerance {
                step = step.min(delta);
                sampled += 1;
            }
        }
        prev = Some(key);
    }

    if sampled == 0 || !step.is_finite() {
        bail!(
            "{}: cannot infer key step: no positive key delta among {} valid records",
            csv_path.display(),
            scanner.records_parsed
        );
    }
    debug!(path = %csv_path.display(), step, sampled, "inferred regular step");
    Ok(step)
}

// =============================================================================
// BINARY RECORD I/O
// =============================================================================

/// Chunk-buffered writer of encoded records.
struct RecordWriter<R: Record> {
    file: File,
    buf: Vec<u8>,
    capacity: usize,
    written: u64,
    _record: PhantomData<R>,
}

impl<R: Record> RecordWriter<R> {
    fn create(path: &Path, buffer_records: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self {
            file,
            buf: Vec::with_capacity(buffer_records * R::SIZE),
            capacity: buffer_records.max(1),
            written: 0,
            _record: PhantomData,
        })
    }

    fn push(&mut self, record: &R) -> Result<()> {
        let at = self.buf.len();
        self.buf.resize(at + R::SIZE, 0);
        record.encode(&mut self.buf[at..]);
        self.written += 1;
        if self.buf.len() >= self.capacity * R::SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf).context("writing record chunk")?;
            self.buf.clear();
        }
        Ok(())
    }

    fn finish(mut self) -> Result<u64> {
        self.flush()?;
        self.file.sync_all().context("syncing record file")?;
        Ok(self.written)
    }
}

/// Write `records` to `path`, replacing it.
pub fn write_records<R: Record>(path: &Path, records: &[R]) -> Result<()> {
    let mut writer = RecordWriter::<R>::create(path, 4096)?;
    for r in records {
        writer.push(r)?;
    }
    writer.finish()?;
    Ok(())
}

/// Read a whole record file into memory.
pub fn read_records<R: Record>(path: &Path) -> Result<Vec<R>> {
    let mut bytes = Vec::new();
    File::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .read_to_end(&mut bytes)
        .with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() % R::SIZE != 0 {
        bail!(
            "{}: size {} is not a multiple of the {} record size {}",
            path.display(),
            bytes.len(),
            R::KIND,
            R::SIZE
        );
    }
    Ok(bytes.chunks_exact(R::SIZE).map(R::decode).collect())
}

/// Dump a record file back to delimited text via `Record::to_csv`.
/// Invalid (null) records are written only when `include_invalid` is set.
pub fn export_csv<R: Record>(
    bin_path: &Path,
    csv_path: &Path,
    delimiter: char,
    include_invalid: bool,
) -> Result<u64> {
    let records = read_records::<R>(bin_path)?;
    let file = File::create(csv_path)
        .with_context(|| format!("creating {}", csv_path.display()))?;
    let mut out = BufWriter::new(file);
    let mut written = 0u64;
    for r in records.iter().filter(|r| include_invalid || r.is_valid()) {
        writeln!(out, "{}", r.to_csv(delimiter))
            .with_context(|| format!("writing {}", csv_path.display()))?;
        written += 1;
    }
    out.flush()
        .with_context(|| format!("flushing {}", csv_path.display()))?;
    Ok(written)
}

// =============================================================================
// GRID REGULARIZATION
// =============================================================================

/// Build the canonical raw grid from `csv_path` into `out_path`.
pub fn regularize<R: Record>(
    csv_path: &Path,
    out_path: &Path,
    cfg: &SanitizeConfig,
) -> Result<SanitizeReport> {
    let step = infer_step::<R>(csv_path, cfg)?;
    let dup_threshold = cfg.duplicate_threshold(step);

    let mut scanner = CsvScanner::<R>::open(csv_path, cfg)?;
    let mut writer = RecordWriter::<R>::create(out_path, cfg.buffer_records)?;
    let mut report = SanitizeReport {
        step,
        ..Default::default()
    };

    let Some((mut anchor_line, mut anchor)) = scanner.next_valid()? else {
        bail!("{}: no valid records", csv_path.display());
    };
    report.leftmost_key = anchor.key_value();

    while let Some((line_no, next)) = scanner.next_valid()? {
        let anchor_key = anchor.key_value();
        let key = next.key_value();
        let delta = key - anchor_key;

        if delta.abs() <= dup_threshold {
            if report.duplicates_collapsed == 0 {
                warn!(
                    path = %csv_path.display(),
                    line = line_no,
                    previous_line = anchor_line,
                    key,
                    "duplicate key collapsed, keeping latest (further occurrences are counted only)"
                );
            }
            report.duplicates_collapsed += 1;
            anchor = next;
            anchor_line = line_no;
            continue;
        }
        if delta < 0.0 {
            bail!(
                "{}:{}: non-monotonic key {} after {} (line {})",
                csv_path.display(),
                line_no,
                key,
                anchor_key,
                anchor_line
            );
        }

        let ratio = delta / step;
        if !ratio.is_finite() {
            bail!(
                "{}:{}: non-finite step ratio (delta {} / step {})",
                csv_path.display(),
                line_no,
                delta,
                step
            );
        }
        let steps = ratio.round();
        let residual = (ratio - steps).abs();
        if residual > cfg.rel_tolerance {
            bail!(
                "{}:{}: key {} is off the grid: delta {} is {:.6} steps of {} (tolerance {})",
                csv_path.display(),
                line_no,
                key,
                delta,
                ratio,
                step,
                cfg.rel_tolerance
            );
        }
        if steps < 1.0 {
            bail!(
                "{}:{}: key {} rounds to {} steps after {}",
                csv_path.display(),
                line_no,
                key,
                steps,
                anchor_key
            );
        }
        if steps > cfg.max_gap_steps as f64 {
            bail!(
                "{}:{}: gap of {} steps after key {} exceeds the limit of {}",
                csv_path.display(),
                line_no,
                steps,
                anchor_key,
                cfg.max_gap_steps
            );
        }
        let steps = steps as u64;

        writer.push(&anchor)?;
        for k in 1..steps {
            writer.push(&R::null_instance(anchor_key + k as f64 * step))?;
        }
        report.gaps_filled = report
            .gaps_filled
            .checked_add(steps - 1)
            .context("gap fill counter overflow")?;

        anchor = next;
        anchor_line = line_no;
    }

    report.rightmost_key = anchor.key_value();
    writer.push(&anchor)?;
    report.records_written = writer
        .finish()
        .with_context(|| format!("finishing {}", out_path.display()))?;

    report.lines_read = scanner.lines_read;
    report.records_parsed = scanner.records_parsed;
    report.unparsable_lines = scanner.unparsable;
    report.invalid_lines = scanner.invalid;
    Ok(report)
}

// =============================================================================
// ENTRY POINT
// =============================================================================

/// Build `<stem>.normW<window>.bin` from a raw canonical file unless it is
/// already fresh. Returns the normalized path and whether it was rebuilt.
pub fn ensure_normalized<R: Record>(
    raw: &Path,
    window: usize,
    force_rebuild: bool,
    cfg: &SanitizeConfig,
) -> Result<(PathBuf, bool)> {
    if window == 0 {
        bail!("{}: normalization window must be >= 1", raw.display());
    }
    let norm = norm_path(raw, window);
    if !force_rebuild && !is_stale(&norm, raw)? {
        debug!(out = %norm.display(), "normalized file is fresh, skipping");
        return Ok((norm, false));
    }
    let tmp = tmp_sibling(&norm);
    fs::copy(raw, &tmp)
        .with_context(|| format!("copying {} -> {}", raw.display(), tmp.display()))?;
    if let Err(e) = normalize::<R>(&tmp, StatsWindow::Trailing(window), cfg) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, &norm)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), norm.display()))?;
    Ok((norm, true))
}

/// Where a sanitize call left its artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizeOutcome {
    /// File to open: the normalized file when requested, else the raw file.
    pub path: PathBuf,
    pub raw_path: PathBuf,
    pub rebuilt_raw: bool,
    pub rebuilt_normalized: bool,
    /// Present when the raw grid was rebuilt in this call.
    pub report: Option<SanitizeReport>,
}

/// Sanitize `csv_path` into `<stem>.bin` and, when `norm_window > 0`,
/// `<stem>.normW<norm_window>.bin`. Fresh artifacts are reused unless forced.
pub fn sanitize<R: Record>(
    csv_path: &Path,
    norm_window: usize,
    force_rebuild: bool,
    cfg: &SanitizeConfig,
) -> Result<SanitizeOutcome> {
    let force = force_rebuild || cfg.force_rebuild;
    if !csv_path.is_file() {
        bail!("source CSV not found: {}", csv_path.display());
    }
    let raw = raw_path(csv_path);
    if raw == csv_path {
        bail!("refusing to sanitize {} onto itself", csv_path.display());
    }

    let mut report = None;
    let rebuilt_raw = force || is_stale(&raw, csv_path)?;
    if rebuilt_raw {
        info!(
            csv = %csv_path.display(),
            out = %raw.display(),
            kind = R::KIND,
            forced = force,
            "building canonical grid"
        );
        let tmp = tmp_sibling(&raw);
        let result = regularize::<R>(csv_path, &tmp, cfg);
        let r = match result {
            Ok(r) => r,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        fs::rename(&tmp, &raw)
            .with_context(|| format!("renaming {} -> {}", tmp.display(), raw.display()))?;
        info!(
            out = %raw.display(),
            records = r.records_written,
            gaps_filled = r.gaps_filled,
            duplicates = r.duplicates_collapsed,
            invalid_lines = r.invalid_lines,
            unparsable_lines = r.unparsable_lines,
            step = r.step,
            "canonical grid written"
        );
        report = Some(r);
    } else {
        debug!(out = %raw.display(), "canonical grid is fresh, skipping rebuild");
    }

    if norm_window == 0 {
        return Ok(SanitizeOutcome {
            path: raw.clone(),
            raw_path: raw,
            rebuilt_raw,
            rebuilt_normalized: false,
            report,
        });
    }

    let (norm, rebuilt_normalized) =
        ensure_normalized::<R>(&raw, norm_window, force || rebuilt_raw, cfg)?;

    Ok(SanitizeOutcome {
        path: norm,
        raw_path: raw,
        rebuilt_raw,
        rebuilt_normalized,
        report,
    })
}
