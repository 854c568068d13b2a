use anyhow::{bail, Context, Result};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use std::path::Path;

/// Pack `dir` into an in-memory `.tar.gz` whose entries are relative to `dir`.
pub fn pack_directory(dir: &Path) -> Result<Bytes> {
    if !dir.is_dir() {
        bail!("terraform directory {} is not a directory", dir.display());
    }
    let encoder = GzEncoder::new(Vec::with_capacity(64 * 1024), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("archive {}", dir.display()))?;
    let encoder = builder.into_inner().context("finish tar stream")?;
    let bytes = encoder.finish().context("finish gzip stream")?;
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn packs_nested_files_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.tf"), "resource \"null_resource\" \"x\" {}").unwrap();
        std::fs::create_dir(dir.path().join("modules")).unwrap();
        std::fs::write(dir.path().join("modules/vpc.tf"), "# vpc").unwrap();

        let packed = pack_directory(dir.path()).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(packed.as_ref()));
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut e = entry.unwrap();
            let name = e.path().unwrap().to_string_lossy().to_string();
            if name.ends_with("main.tf") {
                let mut body = String::new();
                e.read_to_string(&mut body).unwrap();
                assert!(body.contains("null_resource"));
            }
            names.push(name);
        }
        assert!(names.iter().any(|n| n.trim_start_matches("./") == "main.tf"));
        assert!(names
            .iter()
            .any(|n| n.trim_start_matches("./") == "modules/vpc.tf"));
        assert!(names.iter().all(|n| !n.contains(&*dir.path().to_string_lossy())));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = pack_directory(&dir.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("is not a directory"));
    }
}
