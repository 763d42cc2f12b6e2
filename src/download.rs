/// Engine library and model auto-download.
///
/// Fetches the prebuilt engine archive for the host platform into the
/// library cache and extracts it, and fetches `.gguf` models from
/// HuggingFace into the model cache. Both skip the download when the target
/// is already on disk.
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::engine::native::LIBRARY_BASE_NAME;

/// Release download root for prebuilt engine archives.
const RELEASE_BASE: &str = "https://github.com/amikos-tech/llamacpp-embedder/releases/download";

/// Base URL for HuggingFace model files.
const HF_BASE: &str = "https://huggingface.co";

// ── Engine library ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::Zip => "zip",
        }
    }
}

/// One prebuilt engine archive: platform plus release version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRelease {
    os: &'static str,
    arch: &'static str,
    version: String,
}

impl LibraryRelease {
    /// Release for the platform this binary runs on.
    pub fn for_host(version: &str) -> Result<Self> {
        Self::new(std::env::consts::OS, std::env::consts::ARCH, version)
    }

    /// Release for a Rust `(os, arch)` pair, e.g. `("linux", "x86_64")`.
    ///
    /// Only Linux, macOS and Windows have prebuilt archives; Windows is
    /// x64-only, other architectures map to x64 unless they are aarch64.
    pub fn new(os: &str, arch: &str, version: &str) -> Result<Self> {
        anyhow::ensure!(!version.is_empty(), "library version must not be empty");
        let os = match os {
            "linux" => "linux",
            "macos" => "macos",
            "windows" => "win",
            other => anyhow::bail!("no prebuilt engine library for {other}"),
        };
        let arch = match (os, arch) {
            ("win", _) => "x64",
            (_, "aarch64") => "arm64",
            _ => "x64",
        };
        Ok(Self {
            os,
            arch,
            version: version.to_string(),
        })
    }

    #[must_use]
    pub fn format(&self) -> ArchiveFormat {
        if self.os == "win" {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        }
    }

    /// e.g. `llama-embedder-linux-x64-v0.0.8`
    #[must_use]
    pub fn archive_base(&self) -> String {
        format!("{LIBRARY_BASE_NAME}-{}-{}-{}", self.os, self.arch, self.version)
    }

    #[must_use]
    pub fn archive_name(&self) -> String {
        format!("{}.{}", self.archive_base(), self.format().extension())
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("{RELEASE_BASE}/go%2F{}/{}", self.version, self.archive_name())
    }

    /// Platform file name of the library inside the archive.
    #[must_use]
    pub fn library_file_name(&self) -> String {
        match self.os {
            "macos" => format!("lib{LIBRARY_BASE_NAME}.dylib"),
            "win" => format!("{LIBRARY_BASE_NAME}.dll"),
            _ => format!("lib{LIBRARY_BASE_NAME}.so"),
        }
    }

    /// Directory the archive is extracted into.
    #[must_use]
    pub fn install_dir(&self, lib_cache: &Path) -> PathBuf {
        lib_cache.join(self.archive_base())
    }

    #[must_use]
    pub fn library_path(&self, lib_cache: &Path) -> PathBuf {
        self.install_dir(lib_cache).join(self.library_file_name())
    }
}

/// Make sure `release` is extracted under `lib_cache` and return the path of
/// its shared library.
///
/// An existing install directory is trusted as is.
pub fn ensure_library(release: &LibraryRelease, lib_cache: &Path) -> Result<PathBuf> {
    let install_dir = release.install_dir(lib_cache);
    let library = release.library_path(lib_cache);
    if install_dir.is_dir() {
        info!("Engine library found in {}, skipping download", install_dir.display());
        return Ok(library);
    }

    fs::create_dir_all(lib_cache)
        .with_context(|| format!("failed to create library cache: {}", lib_cache.display()))?;

    let archive = lib_cache.join(release.archive_name());
    let url = release.url();
    info!("Downloading engine library from {url}");
    download_file(&archive, &url, None)
        .with_context(|| format!("failed to download {}", release.archive_name()))?;

    let extracted = extract_archive(&archive, release.format(), &install_dir);
    if let Err(e) = fs::remove_file(&archive) {
        info!("Could not remove {}: {e}", archive.display());
    }
    if let Err(e) = extracted {
        // A half-extracted directory would be trusted on the next call.
        let _ = fs::remove_dir_all(&install_dir);
        return Err(e);
    }

    anyhow::ensure!(
        library.exists(),
        "archive {} does not contain {}",
        release.archive_name(),
        release.library_file_name()
    );
    info!("Engine library installed at {}", library.display());
    Ok(library)
}

/// Unpack `archive` into `dest`, creating it.
pub(crate) fn extract_archive(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create directory: {}", dest.display()))?;
    let file = File::open(archive)
        .with_context(|| format!("failed to open archive: {}", archive.display()))?;

    match format {
        ArchiveFormat::TarGz => {
            let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
            tar.unpack(dest)
                .with_context(|| format!("failed to extract {}", archive.display()))?;
        }
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("invalid zip archive: {}", archive.display()))?;
            zip.extract(dest)
                .with_context(|| format!("failed to extract {}", archive.display()))?;
        }
    }
    Ok(())
}

// ── Models ───────────────────────────────────────────────────────────

/// Download URL of `file` in the HuggingFace repository `repo`.
#[must_use]
pub fn hf_model_url(repo: &str, file: &str) -> String {
    format!("{HF_BASE}/{repo}/resolve/main/{file}")
}

/// Make sure `file` from `repo` is in `model_cache` and return its path.
///
/// Only `.gguf` files are accepted. `token` is sent as a bearer token for
/// gated repositories.
pub fn ensure_hf_model(
    repo: &str,
    file: &str,
    model_cache: &Path,
    token: Option<&str>,
) -> Result<PathBuf> {
    anyhow::ensure!(
        !repo.is_empty() && !file.is_empty(),
        "HuggingFace repository and file are required"
    );
    anyhow::ensure!(
        file.to_ascii_lowercase().ends_with(".gguf"),
        "model file must be a .gguf file: {file}"
    );
    let name = Path::new(file)
        .file_name()
        .with_context(|| format!("no file name in {file}"))?;
    let dest = model_cache.join(name);
    if dest.exists() {
        info!("Model found at {}, skipping download", dest.display());
        return Ok(dest);
    }

    fs::create_dir_all(model_cache)
        .with_context(|| format!("failed to create model cache: {}", model_cache.display()))?;

    // Download next to the target so a failed transfer never looks complete.
    let partial = dest.with_extension("gguf.part");
    let url = hf_model_url(repo, file);
    info!("Downloading model from {url}");
    if let Err(e) = download_file(&partial, &url, token) {
        let _ = fs::remove_file(&partial);
        return Err(e.context(format!("failed to download {file}")));
    }
    fs::rename(&partial, &dest)
        .with_context(|| format!("failed to move model into {}", dest.display()))?;
    info!("Model saved to {}", dest.display());
    Ok(dest)
}

// ── Transfer ─────────────────────────────────────────────────────────

/// Stream `url` into `dest` with a progress bar.
fn download_file(dest: &Path, url: &str, token: Option<&str>) -> Result<()> {
    let client = reqwest::blocking::Client::new();
    let mut request = client.get(url);
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        request = request.bearer_auth(token);
    }
    let mut resp = request
        .send()
        .with_context(|| format!("HTTP request failed: {url}"))?;

    if !resp.status().is_success() {
        anyhow::bail!("bad status: {} for {url}", resp.status());
    }

    let pb = match resp.content_length() {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("  {bar:40.cyan/blue} {percent}% ({bytes}/{total_bytes}) {msg}")
            {
                pb.set_style(style.progress_chars("█▓░"));
            }
            pb
        }
        _ => ProgressBar::new_spinner(),
    };

    let file = File::create(dest)
        .with_context(|| format!("failed to create file: {}", dest.display()))?;
    let mut writer = pb.wrap_write(BufWriter::new(file));
    resp.copy_to(&mut writer)
        .with_context(|| format!("failed to write {}", dest.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", dest.display()))?;
    pb.finish_and_clear();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;

    fn release(os: &str, arch: &str) -> LibraryRelease {
        LibraryRelease::new(os, arch, "v0.0.8").unwrap()
    }

    #[test]
    fn test_release_names() {
        let linux = release("linux", "x86_64");
        assert_eq!(linux.archive_base(), "llama-embedder-linux-x64-v0.0.8");
        assert_eq!(linux.archive_name(), "llama-embedder-linux-x64-v0.0.8.tar.gz");
        assert_eq!(linux.library_file_name(), "libllama-embedder.so");

        let mac = release("macos", "aarch64");
        assert_eq!(mac.archive_base(), "llama-embedder-macos-arm64-v0.0.8");
        assert_eq!(mac.library_file_name(), "libllama-embedder.dylib");

        let win = release("windows", "aarch64");
        assert_eq!(win.archive_name(), "llama-embedder-win-x64-v0.0.8.zip");
        assert_eq!(win.format(), ArchiveFormat::Zip);
        assert_eq!(win.library_file_name(), "llama-embedder.dll");
    }

    #[test]
    fn test_release_url() {
        assert_eq!(
            release("linux", "aarch64").url(),
            "https://github.com/amikos-tech/llamacpp-embedder/releases/download/go%2Fv0.0.8/llama-embedder-linux-arm64-v0.0.8.tar.gz"
        );
    }

    #[test]
    fn test_unsupported_platform() {
        assert!(LibraryRelease::new("freebsd", "x86_64", "v0.0.8").is_err());
        assert!(LibraryRelease::new("linux", "x86_64", "").is_err());
    }

    #[test]
    fn test_library_path_layout() {
        let cache = Path::new("/cache/llama_cache/libs");
        assert_eq!(
            release("linux", "x86_64").library_path(cache),
            PathBuf::from("/cache/llama_cache/libs/llama-embedder-linux-x64-v0.0.8/libllama-embedder.so")
        );
    }

    #[test]
    fn test_ensure_library_skips_existing_install() {
        let dir = tempdir().unwrap();
        let release = release("linux", "x86_64");
        fs::create_dir_all(release.install_dir(dir.path())).unwrap();

        // No network access needed: the install directory is trusted.
        let path = ensure_library(&release, dir.path()).unwrap();
        assert_eq!(path, release.library_path(dir.path()));
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("engine.tar.gz");
        let payload = b"not really a shared object";

        let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "libllama-embedder.so", &payload[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.path().join("llama-embedder-linux-x64-v0.0.8");
        extract_archive(&archive, ArchiveFormat::TarGz, &dest).unwrap();
        assert_eq!(fs::read(dest.join("libllama-embedder.so")).unwrap(), payload);
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("engine.zip");
        fs::write(&archive, "definitely not a zip").unwrap();
        assert!(extract_archive(&archive, ArchiveFormat::Zip, &dir.path().join("out")).is_err());
    }

    #[test]
    fn test_hf_model_url() {
        assert_eq!(
            hf_model_url("ChristianAzinn/snowflake-arctic-embed-s-gguf", "snowflake-arctic-embed-s-f16.GGUF"),
            "https://huggingface.co/ChristianAzinn/snowflake-arctic-embed-s-gguf/resolve/main/snowflake-arctic-embed-s-f16.GGUF"
        );
    }

    #[test]
    fn test_hf_model_requires_gguf() {
        let dir = tempdir().unwrap();
        let err = ensure_hf_model("org/repo", "model.onnx", dir.path(), None).unwrap_err();
        assert!(err.to_string().contains(".gguf"), "got: {err}");
        assert!(ensure_hf_model("", "model.gguf", dir.path(), None).is_err());
    }

    #[test]
    fn test_hf_model_skips_existing_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("model.gguf"), "cached").unwrap();

        let path = ensure_hf_model("org/repo", "sub/model.gguf", dir.path(), None).unwrap();
        assert_eq!(path, dir.path().join("model.gguf"));
        assert_eq!(fs::read_to_string(path).unwrap(), "cached");
    }
}
