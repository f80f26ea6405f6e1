use std::path::{Path, PathBuf};

/// Platform file name of the ONNX Runtime shared library.
#[cfg(target_os = "macos")]
const ORT_LIB: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH when it is missing or points nowhere.
///
/// Must run before the first detector is loaded. Lookup order:
/// 1) existing ORT_DYLIB_PATH (if the file exists)
/// 2) models/onnxruntime/lib/<lib> and models/<lib> near the cwd or exe
/// 3) system library directories
///
/// Returns the path in effect, if any.
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing_path);
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let found = ort_candidates(&search_roots())
        .into_iter()
        .find(|candidate| candidate.is_file());
    match found {
        Some(path) => {
            // SAFETY: called once at startup before any worker threads or ORT
            // sessions exist, so nothing reads the environment concurrently.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &path);
            }
            tracing::info!(path = %path.display(), "configured ORT_DYLIB_PATH");
            Some(path)
        }
        None => {
            tracing::warn!("could not locate {ORT_LIB}; set ORT_DYLIB_PATH to an ONNX Runtime build");
            None
        }
    }
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    roots
}

fn ort_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB));
        candidates.push(root.join("models").join(ORT_LIB));
    }

    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/opt/homebrew/lib").join(ORT_LIB));
    }
    for dir in ["/usr/local/lib", "/usr/lib"] {
        candidates.push(PathBuf::from(dir).join(ORT_LIB));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_search_models_dirs_first() {
        let roots = vec![PathBuf::from("/work"), PathBuf::from("/opt/app")];
        let candidates = ort_candidates(&roots);
        assert_eq!(candidates[0], Path::new("/work/models/onnxruntime/lib").join(ORT_LIB));
        assert_eq!(candidates[1], Path::new("/work/models").join(ORT_LIB));
        assert_eq!(candidates[2], Path::new("/opt/app/models/onnxruntime/lib").join(ORT_LIB));
        assert!(candidates.last().unwrap().ends_with(ORT_LIB));
    }
}
