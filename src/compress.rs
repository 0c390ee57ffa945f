use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::debug;

const ZSTD_LEVEL: u32 = 15;
const LZ4_LEVEL: u32 = 9;
const XZ_LEVEL: u32 = 6;
const GZIP_LEVEL: u32 = 9;

/// Compression methods in order of preference. `Plain` (no compression) is
/// always available and terminates the probe list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    #[cfg(feature = "zstd-lib")]
    ZstdLib,
    Zstd,
    Lz4,
    Xz,
    Gzip,
    Plain,
}

impl Method {
    /// Filename suffix owned by this method, used when naming backup slots.
    pub fn extension(self) -> &'static str {
        match self {
            #[cfg(feature = "zstd-lib")]
            Method::ZstdLib => ".zst",
            Method::Zstd => ".zst",
            Method::Lz4 => ".lz4",
            Method::Xz => ".xz",
            Method::Gzip => ".gz",
            Method::Plain => "",
        }
    }

    pub fn is_plain(self) -> bool {
        matches!(self, Method::Plain)
    }

    fn binary(self) -> Option<&'static str> {
        match self {
            Method::Zstd => Some("zstd"),
            Method::Lz4 => Some("lz4"),
            Method::Xz => Some("xz"),
            Method::Gzip => Some("gzip"),
            _ => None,
        }
    }

    fn compress_args(self) -> Vec<String> {
        match self {
            Method::Zstd => vec![format!("-{ZSTD_LEVEL}"), "--quiet".into(), "--threads=0".into()],
            Method::Lz4 => vec![format!("-{LZ4_LEVEL}"), "--quiet".into()],
            Method::Xz => vec![format!("-{XZ_LEVEL}"), "--quiet".into()],
            Method::Gzip => vec![format!("-{GZIP_LEVEL}"), "--quiet".into()],
            _ => Vec::new(),
        }
    }

    fn decompress_args(self) -> Vec<String> {
        match self {
            Method::Zstd => {
                vec!["--decompress".into(), "--quiet".into(), "--threads=0".into(), "--stdout".into()]
            }
            Method::Lz4 => vec!["--decompress".into(), "--quiet".into(), "--stdout".into()],
            Method::Xz => vec!["--decompress".into(), "--quiet".into(), "--stdout".into()],
            Method::Gzip => vec!["--decompress".into(), "--quiet".into(), "--stdout".into()],
            _ => Vec::new(),
        }
    }

    /// Recognize a method from a filename suffix. Lets mixed-method backup
    /// chains coexist when the active method changed between runs.
    pub fn from_path(path: &Path) -> Method {
        let name = path.to_string_lossy();
        if name.ends_with(".zst") {
            #[cfg(feature = "zstd-lib")]
            return Method::ZstdLib;
            #[cfg(not(feature = "zstd-lib"))]
            return Method::Zstd;
        }
        if name.ends_with(".lz4") {
            Method::Lz4
        } else if name.ends_with(".xz") {
            Method::Xz
        } else if name.ends_with(".gz") {
            Method::Gzip
        } else {
            Method::Plain
        }
    }
}

/// Suffixes to probe when looking for an existing backup slot, most
/// preferred method first, uncompressed last.
pub const KNOWN_EXTENSIONS: &[&str] = &[".zst", ".lz4", ".xz", ".gz", ""];

/// The codec resolved at startup; immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct Compressor {
    method: Method,
    binary: Option<PathBuf>,
}

impl Compressor {
    /// Probe the priority-ordered method list and return the first available
    /// one. Never fails: `Plain` is the unconditional terminal fallback.
    pub fn detect() -> Compressor {
        #[cfg(feature = "zstd-lib")]
        {
            debug!("cmpr: using in-process zstd codec");
            return Compressor { method: Method::ZstdLib, binary: None };
        }

        #[cfg(not(feature = "zstd-lib"))]
        {
            for method in [Method::Zstd, Method::Lz4, Method::Xz, Method::Gzip] {
                let name = method.binary().unwrap_or_default();
                if let Some(binary) = find_in_path(name) {
                    debug!("cmpr: detected compressor: {}", binary.display());
                    return Compressor { method, binary: Some(binary) };
                }
            }
            debug!("cmpr: no compressor available, storing uncompressed");
            Compressor { method: Method::Plain, binary: None }
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// A no-compression compressor; handy when codecs would only get in the
    /// way (tests, debugging).
    pub fn plain() -> Compressor {
        Compressor { method: Method::Plain, binary: None }
    }

    pub fn extension(&self) -> &'static str {
        self.method.extension()
    }

    /// Compress `source` into `destination`, preserving the source's
    /// modification time and removing the source only afterwards. With the
    /// `Plain` method this is a rename. A partially written destination is
    /// cleaned up on failure and the source is left intact.
    pub fn compress_file(&self, source: &Path, destination: &Path) -> Result<()> {
        let result = self.run_compress(source, destination);
        if result.is_err() {
            let _ = fs::remove_file(destination);
        }
        result
    }

    fn run_compress(&self, source: &Path, destination: &Path) -> Result<()> {
        if self.method.is_plain() {
            return fs::rename(source, destination).with_context(|| {
                format!("renaming {} -> {}", source.display(), destination.display())
            });
        }

        let mtime = fs::metadata(source)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("reading mtime of {}", source.display()))?;

        match self.method {
            #[cfg(feature = "zstd-lib")]
            Method::ZstdLib => {
                let mut src = File::open(source)
                    .with_context(|| format!("opening {}", source.display()))?;
                let dst = File::create(destination)
                    .with_context(|| format!("creating {}", destination.display()))?;
                zstd::stream::copy_encode(&mut src, &dst, ZSTD_LEVEL as i32)
                    .with_context(|| format!("compressing {}", source.display()))?;
                dst.set_modified(mtime)?;
            }
            method => {
                let binary = self
                    .binary
                    .clone()
                    .with_context(|| format!("no binary resolved for {method:?}"))?;
                let src = File::open(source)
                    .with_context(|| format!("opening {}", source.display()))?;
                let dst = File::create(destination)
                    .with_context(|| format!("creating {}", destination.display()))?;
                let status = Command::new(&binary)
                    .args(method.compress_args())
                    .stdin(Stdio::from(src))
                    .stdout(Stdio::from(dst))
                    .status()
                    .with_context(|| format!("running {}", binary.display()))?;
                if !status.success() {
                    bail!("{} exited with {status}", binary.display());
                }
                File::options()
                    .write(true)
                    .open(destination)?
                    .set_modified(mtime)?;
            }
        }

        fs::remove_file(source)
            .with_context(|| format!("removing {}", source.display()))?;
        Ok(())
    }

    /// Open `path` for reading, transparently decompressing with the active
    /// method (raw read when `Plain`).
    pub fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        open_method(self.method, path)
    }

    /// Open `path` for reading, picking the method from its filename suffix.
    pub fn open_detected(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        open_method(Method::from_path(path), path)
    }
}

/// Decompressing reader driven by an external binary through pipes.
struct PipeReader {
    // dropped before `child`, closing the pipe so `wait` can finish
    out: ChildStdout,
    child: Child,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.out.read(buf)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn open_method(method: Method, path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    match method {
        Method::Plain => Ok(Box::new(file)),
        #[cfg(feature = "zstd-lib")]
        Method::ZstdLib => {
            let decoder = zstd::stream::read::Decoder::new(file)
                .with_context(|| format!("decompressing {}", path.display()))?;
            Ok(Box::new(decoder))
        }
        method => {
            let name = method.binary().unwrap_or_default();
            let binary = find_in_path(name)
                .with_context(|| format!("{name} not found in PATH for {}", path.display()))?;
            let mut child = Command::new(&binary)
                .args(method.decompress_args())
                .stdin(Stdio::from(file))
                .stdout(Stdio::piped())
                .spawn()
                .with_context(|| format!("running {}", binary.display()))?;
            let out = child
                .stdout
                .take()
                .with_context(|| format!("no stdout pipe from {}", binary.display()))?;
            Ok(Box::new(PipeReader { out, child }))
        }
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
