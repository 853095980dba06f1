use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use sha2::Digest as _;

use crate::config::path_segment;
use crate::formats::{RestaurantIdentity, ReviewRecord};

pub const PARTIAL_EXTENSION: &str = "csv";

/// Stable per-restaurant file inside a city's staging directory.
///
/// The hash suffix keeps names that sanitize to the same segment apart.
pub fn partial_path(staging_dir: &Path, identity: &RestaurantIdentity) -> PathBuf {
    let digest = sha2::Sha256::digest(identity.name.as_bytes());
    let short = hex::encode(&digest[..6]);
    staging_dir.join(format!(
        "{}-{short}.{PARTIAL_EXTENSION}",
        path_segment(&identity.name)
    ))
}

/// Writes the header and one row per record, replacing any previous file at `path`.
///
/// Rows land in a temp file first, so a crash never leaves a half-written partial
/// where the aggregator would pick it up.
pub fn write_partial(path: &Path, records: &[ReviewRecord]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("partial path must have parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create staging dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let file = File::create(&tmp_path)
        .with_context(|| format!("create partial tmp: {}", tmp_path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file));

    writer
        .write_record(ReviewRecord::HEADER)
        .context("write partial header")?;
    for record in records {
        writer.serialize(record).context("write review row")?;
    }
    writer.flush().context("flush partial")?;
    drop(writer);

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename partial into place: {}", path.display()))?;
    Ok(())
}
