use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::error::HarvestError;
use crate::formats::ReviewRecord;
use crate::partial::PARTIAL_EXTENSION;

/// How the merge treats an output file left by an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Replace it: one fresh header, then this run's rows only.
    #[default]
    Replace,
    /// Keep its rows and add this run's rows under its header.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub partials: usize,
    pub records: usize,
    /// The output already existed and rows were appended under its header.
    pub appended: bool,
}

/// Writes a fresh `output_path` holding one header and every row of every partial file
/// in `staging_dir`, then deletes the partials and the staging directory.
///
/// A partial is read completely before any of its rows are written. If one cannot be
/// read the merge stops with [`HarvestError::Merge`]: partials already copied are
/// deleted, the failing one and everything not yet visited stay on disk.
pub fn merge(staging_dir: &Path, output_path: &Path) -> anyhow::Result<MergeReport> {
    merge_with(staging_dir, output_path, MergeMode::Replace)
}

/// [`merge`], with the treatment of an existing output chosen by `mode`.
pub fn merge_with(
    staging_dir: &Path,
    output_path: &Path,
    mode: MergeMode,
) -> anyhow::Result<MergeReport> {
    let partials = list_partials(staging_dir)?;

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }
    let (mut writer, appended) = match mode {
        MergeMode::Replace => (create_output(output_path)?, false),
        MergeMode::Append => open_output(output_path)?,
    };

    let mut report = MergeReport {
        partials: 0,
        records: 0,
        appended,
    };
    let mut copied: Vec<PathBuf> = Vec::with_capacity(partials.len());

    for partial in &partials {
        let rows = match read_partial(partial) {
            Ok(rows) => rows,
            Err(source) => {
                writer.flush().context("flush merged output")?;
                drop(writer);
                remove_files(&copied)?;
                return Err(HarvestError::Merge {
                    path: partial.clone(),
                    restaurant: restaurant_label(partial),
                    source,
                }
                .into());
            }
        };
        for row in &rows {
            writer
                .write_record(row)
                .with_context(|| format!("write merged row: {}", output_path.display()))?;
        }
        report.records += rows.len();
        report.partials += 1;
        copied.push(partial.clone());
    }

    writer
        .flush()
        .with_context(|| format!("flush merged output: {}", output_path.display()))?;
    drop(writer);

    remove_files(&copied)?;
    remove_staging_dir(staging_dir)?;

    tracing::debug!(
        staging = %staging_dir.display(),
        output = %output_path.display(),
        partials = report.partials,
        records = report.records,
        "merged partial files"
    );
    Ok(report)
}

fn list_partials(staging_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !staging_dir.exists() {
        return Ok(Vec::new());
    }
    let dir = staging_dir
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("non-UTF-8 staging dir: {}", staging_dir.display()))?;
    let pattern = format!("{}/*.{PARTIAL_EXTENSION}", glob::Pattern::escape(dir));

    let mut partials = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("glob partials: {pattern}"))? {
        let path = entry.context("read staging dir entry")?;
        if path.is_file() {
            partials.push(path);
        }
    }
    Ok(partials)
}

fn open_output(output_path: &Path) -> anyhow::Result<(csv::Writer<BufWriter<File>>, bool)> {
    let existing_len = match std::fs::metadata(output_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("stat merged output: {}", output_path.display()));
        }
    };

    if existing_len > 0 {
        let mut reader = csv::Reader::from_path(output_path)
            .with_context(|| format!("open merged output: {}", output_path.display()))?;
        let header = reader
            .headers()
            .with_context(|| format!("read merged output header: {}", output_path.display()))?;
        if header != ReviewRecord::HEADER.as_slice() {
            anyhow::bail!(
                "existing output has an unexpected header, refusing to append: {}",
                output_path.display()
            );
        }

        let file = OpenOptions::new()
            .append(true)
            .open(output_path)
            .with_context(|| format!("open merged output: {}", output_path.display()))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        return Ok((writer, true));
    }

    Ok((create_output(output_path)?, false))
}

fn create_output(output_path: &Path) -> anyhow::Result<csv::Writer<BufWriter<File>>> {
    let file = File::create(output_path)
        .with_context(|| format!("create merged output: {}", output_path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file));
    writer
        .write_record(ReviewRecord::HEADER)
        .context("write merged header")?;
    Ok(writer)
}

fn read_partial(path: &Path) -> anyhow::Result<Vec<csv::StringRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("open partial: {}", path.display()))?;
    let header = reader.headers().context("read partial header")?;
    if header != ReviewRecord::HEADER.as_slice() {
        anyhow::bail!("partial has an unexpected header: {}", path.display());
    }
    reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("read partial rows: {}", path.display()))
}

fn restaurant_label(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn remove_files(paths: &[PathBuf]) -> anyhow::Result<()> {
    for path in paths {
        std::fs::remove_file(path)
            .with_context(|| format!("remove merged partial: {}", path.display()))?;
    }
    Ok(())
}

/// Orphaned temp files from interrupted partial writes go too; anything else keeps
/// the directory alive and is reported.
fn remove_staging_dir(staging_dir: &Path) -> anyhow::Result<()> {
    if !staging_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(staging_dir)
        .with_context(|| format!("read staging dir: {}", staging_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove stale temp file: {}", path.display()))?;
        }
    }
    std::fs::remove_dir(staging_dir)
        .with_context(|| format!("remove staging dir: {}", staging_dir.display()))
}
