//! Zip packaging of split tracks.

use crate::pipeline::error::JobError;
use crate::pipeline::Packager;
use async_trait::async_trait;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Deflate zip with every input stored flat under its file name.
pub struct ZipPackager;

/// Blocking body of [`ZipPackager::package`].
fn write_archive(files: &[PathBuf], archive: &Path) -> Result<(), JobError> {
    let package_err = |e: &dyn std::fmt::Display| JobError::Package(e.to_string());

    let out = File::create(archive).map_err(|e| package_err(&e))?;
    let mut writer = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in files {
        let name = file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| JobError::Package(format!("{} has no usable file name", file.display())))?;
        writer.start_file(name, options).map_err(|e| package_err(&e))?;
        let mut input = BufReader::new(File::open(file).map_err(|e| package_err(&e))?);
        io::copy(&mut input, &mut writer).map_err(|e| package_err(&e))?;
    }

    writer.finish().map_err(|e| package_err(&e))?;
    Ok(())
}

#[async_trait]
impl Packager for ZipPackager {
    async fn package(&self, files: &[PathBuf], archive: &Path) -> Result<PathBuf, JobError> {
        let inputs = files.to_vec();
        let target = archive.to_path_buf();
        tokio::task::spawn_blocking(move || write_archive(&inputs, &target))
            .await
            .map_err(|e| JobError::Package(format!("packaging task failed: {}", e)))??;

        info!(files = files.len(), archive = %archive.display(), "Packaged tracks");
        Ok(archive.to_path_buf())
    }
}
