//! Locating the external pieces the pipeline needs at run time: the ffmpeg
//! family of binaries and the ONNX Runtime / CUDA shared libraries.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found, logged once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibs {
    pub ort_dylib: Option<PathBuf>,
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

/// `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`, then the system library dirs.
fn library_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        #[cfg(windows)]
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

/// `<exe>`, `<exe>/bin`, `<exe>/../bin`, `<cwd>`, `<cwd>/bin`.
fn binary_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = exe_dir() {
        push_unique(&mut dirs, exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("bin"));
        }
        dirs.insert(0, exe_dir);
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
        push_unique(&mut dirs, cwd);
    }
    dirs
}

fn binary_file_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(binary).extension().is_none() {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = binary_file_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Command for `binary` (ffmpeg, ffprobe, nvidia-smi): a copy shipped next
/// to the executable wins over `PATH`.
pub fn command_for(binary: &str) -> Command {
    match find_binary(binary, &binary_dirs()) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load order for GPU runtime libraries: CUDA runtime and math libraries,
/// then cuDNN, then TensorRT. ONNX Runtime's own provider libraries are
/// never preloaded since they need symbols from the core ORT library.
fn preload_rank(file_name: &str) -> Option<u8> {
    let name = file_name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    const CUDA: [&str; 4] = ["cudart", "cublas", "cufft", "curand"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

fn is_shared_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if cfg!(windows) {
        name.to_ascii_lowercase().ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// GPU libraries to preload from `dirs`, in load order. The first directory
/// holding a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut ranked: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if !is_shared_library(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(rank) = preload_rank(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                ranked.push((rank, name, path));
            }
        }
    }

    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
fn preload(path: &Path) -> bool {
    // SAFETY: loading a vendor GPU library with global symbol visibility;
    // it stays mapped for the life of the process.
    match unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn preload(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point ort at a bundled ONNX Runtime and preload GPU libraries by absolute
/// path. Must run before the first session is built; the dynamic loader
/// caches `LD_LIBRARY_PATH` at startup, so setting it later has no effect.
pub fn setup_runtime_libs() -> RuntimeLibs {
    let dirs = library_dirs();
    let mut libs = RuntimeLibs::default();

    match env::var_os(ORT_DYLIB_ENV) {
        Some(path) => {
            libs.ort_dylib = Some(PathBuf::from(path));
            libs.ort_from_env = true;
        }
        None => {
            if let Some(path) = find_ort_dylib(&dirs) {
                env::set_var(ORT_DYLIB_ENV, &path);
                libs.ort_dylib = Some(path);
            }
        }
    }

    libs.preloaded = preload_plan(&dirs)
        .into_iter()
        .filter(|path| preload(path))
        .collect();
    libs
}

pub fn log_runtime_lib_status(libs: &RuntimeLibs) {
    match &libs.ort_dylib {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), from_env = libs.ort_from_env, "ONNX Runtime library")
        }
        Some(path) => warn!(
            path = %path.display(),
            "{ORT_DYLIB_ENV} points at a missing file"
        ),
        None => warn!("{ORT_DYLIB_ENV} not set, ort falls back to the default search path"),
    }
    for path in &libs.preloaded {
        debug!(path = %path.display(), "Preloaded GPU runtime library");
    }
}
