//! Typed error types for jsplay collaborator traits.
//!
//! Provides [`BridgeError`], the canonical error type for the backends a
//! sandbox reaches through its capabilities (`ModuleResolver`, `HttpBridge`)
//! and for the package manager that populates the module directory.

use thiserror::Error;

/// Canonical error type for jsplay collaborator operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The requested module is not present in the package directory.
    #[error("Cannot find module '{0}'")]
    ModuleNotFound(String),

    /// A module specifier resolved to a path outside the package root.
    #[error("module '{specifier}' resolves outside the package directory")]
    OutsidePackageRoot {
        /// The specifier as written by the script.
        specifier: String,
    },

    /// A package name failed npm naming rules.
    #[error("invalid package name '{name}': {reason}")]
    InvalidPackageName {
        /// The rejected name.
        name: String,
        /// Which rule the name broke.
        reason: String,
    },

    /// A package version or range contained characters that are not allowed.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// An HTTP bridge request failed.
    #[error("fetch failed for '{url}': {message}")]
    Http {
        /// The requested URL.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// The external package tool exited unsuccessfully.
    #[error("package tool failed ({status}): {stderr}")]
    PackageTool {
        /// Exit status rendering.
        status: String,
        /// Trimmed stderr of the tool.
        stderr: String,
    },

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModuleNotFound(_) => "MODULE_NOT_FOUND",
            Self::OutsidePackageRoot { .. } => "OUTSIDE_PACKAGE_ROOT",
            Self::InvalidPackageName { .. } => "INVALID_PACKAGE_NAME",
            Self::InvalidVersion(_) => "INVALID_VERSION",
            Self::Http { .. } => "HTTP_ERROR",
            Self::PackageTool { .. } => "PACKAGE_TOOL_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Http { .. } => true,
            Self::PackageTool { .. } => true,
            Self::Io(_) => true,
            Self::ModuleNotFound(_) => false,
            Self::OutsidePackageRoot { .. } => false,
            Self::InvalidPackageName { .. } => false,
            Self::InvalidVersion(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error object for the UI.
    ///
    /// Returns a JSON object with `error`, `code`, `message`, `retryable`,
    /// and optionally `suggested_fix`. For `ModuleNotFound`, the fix names
    /// the closest installed package when `known_packages` is provided.
    pub fn to_structured_error(&self, known_packages: Option<&[&str]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::ModuleNotFound(specifier) => match known_packages {
                Some(packages) => find_similar_package(specifier, packages),
                None => Some("Install the package first".to_string()),
            },
            Self::OutsidePackageRoot { .. } => {
                Some("Require installed packages by name".to_string())
            }
            Self::Http { .. } => Some("Retry after a delay".to_string()),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest installed package name using Levenshtein distance.
///
/// Only the package part of the specifier is compared, so
/// `lodahs/fp` still suggests `lodash`.
fn find_similar_package(specifier: &str, known_packages: &[&str]) -> Option<String> {
    let name = package_name_of(specifier);
    let mut best: Option<(usize, &str)> = None;

    for &candidate in known_packages {
        let dist = strsim::levenshtein(name, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }

    best.map(|(_, candidate)| format!("Did you mean '{candidate}'?"))
}

/// The package part of a bare specifier: `@scope/name` or `name`.
fn package_name_of(specifier: &str) -> &str {
    let mut cut = specifier.len();
    let mut slashes = 0;
    let needed = if specifier.starts_with('@') { 2 } else { 1 };
    for (i, c) in specifier.char_indices() {
        if c == '/' {
            slashes += 1;
            if slashes == needed {
                cut = i;
                break;
            }
        }
    }
    &specifier[..cut]
}

// Compile-time assertion: BridgeError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<BridgeError>();
};
