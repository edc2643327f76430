//! Missing-dependency detection
//!
//! A failed run whose stderr carries a module-not-found signature is
//! recoverable: install the package, run again. The text format is owned
//! by the interpreter, not by this engine, so detection is string matching
//! over the traceback — but the outcome is a typed signature, not a
//! re-thrown string.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

static IMPORT_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:ModuleNotFoundError|ImportError): No module named '(\w+)'")
        .expect("invalid import error pattern")
});

/// Import-name → installable-package-name mismatches
static PACKAGE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("PIL", "Pillow"),
        ("cv2", "opencv-python"),
        ("bs4", "beautifulsoup4"),
        ("yaml", "pyyaml"),
        ("sklearn", "scikit-learn"),
        ("dateutil", "python-dateutil"),
        ("dotenv", "python-dotenv"),
        ("gi", "PyGObject"),
        ("attr", "attrs"),
        ("serial", "pyserial"),
        ("usb", "pyusb"),
        ("Bio", "biopython"),
    ])
});

/// Structured missing-dependency signature pulled from failure text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingModule {
    /// Import name as the interpreter reported it
    pub module: String,
    /// Name to hand to the package manager
    pub package: String,
}

/// Scan traceback/stderr text for a module-not-found signature
pub fn detect_missing_module(error_text: &str) -> Option<MissingModule> {
    if error_text.is_empty() {
        return None;
    }
    let captures = IMPORT_ERROR_RE.captures(error_text)?;
    let module = captures.get(1)?.as_str().to_string();
    let package = PACKAGE_ALIASES
        .get(module.as_str())
        .map(|p| p.to_string())
        .unwrap_or_else(|| module.clone());
    Some(MissingModule { module, package })
}

/// Host-side pip binary: the interpreter root's own pip when supplied,
/// otherwise whatever pip3 resolves to on PATH.
pub fn pip_binary(interpreter_root: Option<&Path>) -> PathBuf {
    if let Some(root) = interpreter_root {
        return root.join("bin").join("pip");
    }
    which::which("pip3").unwrap_or_else(|_| PathBuf::from("pip3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_module_not_found() {
        let stderr = "\
Traceback (most recent call last):\n\
  File \"script.py\", line 1, in <module>\n\
    import requests\n\
ModuleNotFoundError: No module named 'requests'";
        let missing = detect_missing_module(stderr).unwrap();
        assert_eq!(missing.module, "requests");
        assert_eq!(missing.package, "requests");
    }

    #[test]
    fn test_detects_import_error_variant() {
        let stderr = "ImportError: No module named 'numpy'";
        let missing = detect_missing_module(stderr).unwrap();
        assert_eq!(missing.package, "numpy");
    }

    #[test]
    fn test_maps_import_name_to_package_name() {
        let missing =
            detect_missing_module("ModuleNotFoundError: No module named 'PIL'").unwrap();
        assert_eq!(missing.module, "PIL");
        assert_eq!(missing.package, "Pillow");

        let missing =
            detect_missing_module("ModuleNotFoundError: No module named 'cv2'").unwrap();
        assert_eq!(missing.package, "opencv-python");

        let missing =
            detect_missing_module("ModuleNotFoundError: No module named 'yaml'").unwrap();
        assert_eq!(missing.package, "pyyaml");
    }

    #[test]
    fn test_no_signature_in_unrelated_failures() {
        assert_eq!(detect_missing_module(""), None);
        assert_eq!(detect_missing_module("SyntaxError: invalid syntax"), None);
        assert_eq!(
            detect_missing_module("ValueError: No module named hats in config"),
            None
        );
    }

    #[test]
    fn test_pip_binary_prefers_interpreter_root() {
        let pip = pip_binary(Some(Path::new("/home/op/.venvs/proj")));
        assert_eq!(pip, PathBuf::from("/home/op/.venvs/proj/bin/pip"));
    }

    #[test]
    fn test_pip_binary_without_root_is_pip3() {
        let pip = pip_binary(None);
        assert!(pip.file_name().map(|n| n == "pip3").unwrap_or(false));
    }
}
