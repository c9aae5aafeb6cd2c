//! Offline file commands: `checksum` and `image-info`.

use std::path::Path;

use serde::Serialize;

use solekit_proto::crc32::crc32;
use solekit_proto::image::ImageInfo;

use crate::cli::{ChecksumArgs, GlobalOpts, ImageInfoArgs};
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct FileChecksum {
    file: String,
    size: usize,
    crc32: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSummary {
    file: String,
    version: String,
    header_size: u16,
    image_size: u32,
    sha256: String,
}

impl ImageSummary {
    fn new(path: &Path, info: &ImageInfo) -> Self {
        Self {
            file: path.display().to_string(),
            version: info.version.clone(),
            header_size: info.header_size,
            image_size: info.image_size,
            sha256: info.hash_hex(),
        }
    }
}

fn detail(s: &ImageSummary) -> String {
    [
        format!("File:        {}", s.file),
        format!("Version:     {}", s.version),
        format!("Header size: {} bytes", s.header_size),
        format!("Image size:  {} bytes", s.image_size),
        format!("SHA-256:     {}", s.sha256),
    ]
    .join("\n")
}

pub fn checksum(args: &ChecksumArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let data = std::fs::read(&args.file)?;
    let result = FileChecksum {
        file: args.file.display().to_string(),
        size: data.len(),
        crc32: format!("{:08x}", crc32(&data)),
    };

    let out = output::render_single(
        &global.output,
        &result,
        |r| format!("{}  {} ({} bytes)", r.crc32, r.file, r.size),
        |r| r.crc32.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub fn image_info(args: &ImageInfoArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let info = read_image(&args.file)?.1;
    let summary = ImageSummary::new(&args.file, &info);
    let out = output::render_single(&global.output, &summary, detail, |s| s.version.clone())?;
    output::print_output(&out, global.quiet);
    Ok(())
}

/// Read and validate a firmware image.
pub fn read_image(path: &Path) -> Result<(Vec<u8>, ImageInfo), CliError> {
    let data = std::fs::read(path)?;
    let info = ImageInfo::parse(&data).map_err(|e| CliError::InvalidImage {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok((data, info))
}
