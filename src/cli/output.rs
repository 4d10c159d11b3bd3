//! Result files.

use std::path::{Path, PathBuf};

use crate::aggregate::NumberedOutput;

/// Failure writing a result file.
#[derive(Debug, thiserror::Error)]
#[error("failed to write {}: {source}", path.display())]
pub struct OutputError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), OutputError> {
    std::fs::write(path, lines.join("\n")).map_err(|source| OutputError {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the `all` and `top` views, one line per endpoint.
///
/// Nothing is written when there is nothing to write; existing files are
/// left alone in that case. Returns whether files were written.
pub fn write_outputs(
    output: &NumberedOutput,
    all_path: &Path,
    top_path: &Path,
) -> Result<bool, OutputError> {
    if output.all.is_empty() {
        tracing::warn!("no country reached the limit, no result files written");
        return Ok(false);
    }
    write_lines(all_path, &output.all)?;
    tracing::info!(path = %all_path.display(), lines = output.all.len(), "wrote all results");
    write_lines(top_path, &output.top)?;
    tracing::info!(path = %top_path.display(), lines = output.top.len(), "wrote top results");
    Ok(true)
}
