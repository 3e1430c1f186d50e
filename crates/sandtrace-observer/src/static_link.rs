//! Detection of executables that call interposition cannot observe.
//!
//! A binary with program headers but no dynamic dependency on the C
//! library never loads the interposer, so its accesses are only visible
//! to the tracer. Inspection runs an external tool, so results are cached
//! per modification time and path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sandtrace_common::error::{Result, SandtraceError};

const PROGRAM_HEADER_MARKER: &str = "Program Header:";
const LIBC_DEPENDENCY_MARKER: &str = "NEEDED               libc.so.";

/// Reads the linkage of an executable.
pub trait BinaryInspector: Send + Sync {
    /// Returns `true` if `path` is statically linked.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be inspected.
    fn is_statically_linked(&self, path: &Path) -> Result<bool>;
}

/// Decides linkage from `objdump -p` output.
#[must_use]
pub fn headers_indicate_static(headers: &str) -> bool {
    headers.contains(PROGRAM_HEADER_MARKER) && !headers.contains(LIBC_DEPENDENCY_MARKER)
}

/// [`BinaryInspector`] backed by `objdump -p`.
#[derive(Debug, Clone)]
pub struct ObjdumpInspector {
    objdump: Option<PathBuf>,
}

impl ObjdumpInspector {
    /// Locates `objdump` on `PATH`.
    #[must_use]
    pub fn locate() -> Self {
        let objdump = which::which("objdump").ok();
        if objdump.is_none() {
            tracing::warn!("objdump not found, binaries will be treated as dynamically linked");
        }
        Self { objdump }
    }
}

impl BinaryInspector for ObjdumpInspector {
    fn is_statically_linked(&self, path: &Path) -> Result<bool> {
        let objdump = self.objdump.as_ref().ok_or_else(|| SandtraceError::Tracer {
            message: "objdump is not available".into(),
        })?;
        let output = std::process::Command::new(objdump)
            .arg("-p")
            .arg(path)
            .output()
            .map_err(|e| SandtraceError::Io {
                path: objdump.clone(),
                source: e,
            })?;
        Ok(headers_indicate_static(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Caching front of a [`BinaryInspector`].
pub struct StaticLinkDetector {
    inspector: Box<dyn BinaryInspector>,
    cache: Mutex<HashMap<String, bool>>,
}

impl StaticLinkDetector {
    /// Wraps an inspector with an empty cache.
    #[must_use]
    pub fn new(inspector: Box<dyn BinaryInspector>) -> Self {
        Self {
            inspector,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether `path`, last modified at `mtime`, is statically
    /// linked.
    ///
    /// An inspection failure counts as dynamically linked and is not
    /// cached.
    pub fn is_statically_linked(&self, path: &str, mtime: i64) -> bool {
        let key = format!("{mtime}:{path}");
        if let Some(cached) = self.cache.lock().get(&key) {
            return *cached;
        }
        match self.inspector.is_statically_linked(Path::new(path)) {
            Ok(is_static) => {
                tracing::debug!(path, is_static, "binary inspected");
                let _ = self.cache.lock().insert(key, is_static);
                is_static
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "binary inspection failed");
                false
            }
        }
    }
}

/// Allows any process to attach to the caller with `ptrace`.
///
/// Kernels without the Yama module reject the request with `EINVAL`; they
/// impose no attach restriction, so that counts as success.
///
/// # Errors
///
/// Returns [`SandtraceError::Tracer`] if the permission cannot be granted.
#[cfg(target_os = "linux")]
pub fn grant_trace_permission() -> Result<()> {
    // SAFETY: PR_SET_PTRACER takes a single integer argument and does not
    // touch caller memory.
    let rc = unsafe { libc::prctl(libc::PR_SET_PTRACER, libc::PR_SET_PTRACER_ANY, 0, 0, 0) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINVAL) {
        tracing::debug!("no ptrace scope restriction in place");
        return Ok(());
    }
    Err(SandtraceError::Tracer {
        message: format!("cannot grant ptrace permission: {err}"),
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: tracing escalation requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn grant_trace_permission() -> Result<()> {
    Err(SandtraceError::Tracer {
        message: "trace escalation requires Linux".into(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingInspector {
        calls: Arc<AtomicUsize>,
        result: Result<bool>,
    }

    impl BinaryInspector for CountingInspector {
        fn is_statically_linked(&self, _path: &Path) -> Result<bool> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(v) => Ok(*v),
                Err(_) => Err(SandtraceError::Tracer {
                    message: "boom".into(),
                }),
            }
        }
    }

    fn detector(result: Result<bool>) -> (StaticLinkDetector, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let inspector = CountingInspector {
            calls: Arc::clone(&calls),
            result,
        };
        (StaticLinkDetector::new(Box::new(inspector)), calls)
    }

    #[test]
    fn static_binary_headers() {
        let headers = "Program Header:\n    LOAD off 0x0\n";
        assert!(headers_indicate_static(headers));
    }

    #[test]
    fn dynamic_binary_headers() {
        let headers = "Program Header:\nDynamic Section:\n  NEEDED               libc.so.6\n";
        assert!(!headers_indicate_static(headers));
    }

    #[test]
    fn non_elf_output_is_not_static() {
        assert!(!headers_indicate_static("file format not recognized"));
    }

    #[test]
    fn determination_is_cached_per_mtime_and_path() {
        let (detector, calls) = detector(Ok(true));
        assert!(detector.is_statically_linked("/bin/tool", 100));
        assert!(detector.is_statically_linked("/bin/tool", 100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(detector.is_statically_linked("/bin/tool", 200));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_inspection_is_dynamic_and_retried() {
        let (detector, calls) = detector(Err(SandtraceError::Tracer {
            message: "x".into(),
        }));
        assert!(!detector.is_statically_linked("/bin/tool", 1));
        assert!(!detector.is_statically_linked("/bin/tool", 1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
