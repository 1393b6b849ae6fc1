//! Specifier resolution.

use std::path::Path;

use tracing::debug;

use crate::error::ResolveError;

use super::{CacheManager, ErrorHandler, ModuleStatus, RequireContext};

/// The product of a resolution. `absolute_path` is the module cache key:
/// the normalised request, before extension inference. `source_code` is
/// only populated for `FileRead`.
#[derive(Debug)]
pub struct ResolvedRequire {
    pub status: ModuleStatus,
    pub absolute_path: String,
    pub identifier: String,
    pub source_code: String,
}

impl ResolvedRequire {
    fn error() -> ResolvedRequire {
        ResolvedRequire {
            status: ModuleStatus::ErrorReported,
            absolute_path: String::new(),
            identifier: String::new(),
            source_code: String::new(),
        }
    }
}

/// Resolves one module specifier against its caller context.
pub struct RequireResolver<'a> {
    name: String,
    context: &'a dyn RequireContext,
    cache: &'a mut dyn CacheManager,
    errors: &'a mut dyn ErrorHandler,
    extension: String,
}

impl<'a> RequireResolver<'a> {
    pub fn new(
        name: impl Into<String>,
        context: &'a dyn RequireContext,
        cache: &'a mut dyn CacheManager,
        errors: &'a mut dyn ErrorHandler,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            context,
            cache,
            errors,
            extension: extension.into(),
        }
    }

    /// Resolve the request. `before_load` is invoked with the status and
    /// the absolute path before any source is read, so the caller can
    /// attach a cached value in the same pass.
    pub fn resolve_require(
        mut self,
        mut before_load: impl FnMut(ModuleStatus, &str),
    ) -> ResolvedRequire {
        if !self.context.is_require_allowed() {
            self.errors.report(ResolveError::Disallowed.to_string());
            return ResolvedRequire::error();
        }

        let base = self.base_directory();
        let joined = join_paths(&base, &self.name);
        let absolute = normalize_path(&joined);
        let identifier = self.context.create_identifier(&absolute);

        if self.cache.is_cached(&absolute) {
            debug!("require '{}' hit the module cache", absolute);
            before_load(ModuleStatus::Cached, &absolute);
            return ResolvedRequire {
                status: ModuleStatus::Cached,
                absolute_path: absolute,
                identifier,
                source_code: String::new(),
            };
        }

        let candidates = self.probe_candidates(&absolute);
        match candidates.len() {
            0 => {
                self.errors
                    .report(ResolveError::NotFound(self.name.clone()).to_string());
                ResolvedRequire {
                    status: ModuleStatus::NotFound,
                    absolute_path: absolute,
                    identifier,
                    source_code: String::new(),
                }
            }
            1 => {
                let chosen = &candidates[0];
                match std::fs::read_to_string(chosen) {
                    Ok(source_code) => {
                        debug!("require '{}' resolved to {}", self.name, chosen);
                        before_load(ModuleStatus::FileRead, &absolute);
                        ResolvedRequire {
                            status: ModuleStatus::FileRead,
                            absolute_path: absolute,
                            identifier,
                            source_code,
                        }
                    }
                    Err(err) => {
                        self.errors.report(
                            ResolveError::Io {
                                name: self.name.clone(),
                                message: err.to_string(),
                            }
                            .to_string(),
                        );
                        ResolvedRequire::error()
                    }
                }
            }
            _ => {
                self.errors
                    .report(ResolveError::Ambiguous(self.name.clone()).to_string());
                ResolvedRequire::error()
            }
        }
    }

    fn base_directory(&self) -> String {
        if self.context.is_stdin() {
            return std::env::current_dir()
                .map(|cwd| cwd.display().to_string())
                .unwrap_or_else(|_| ".".to_string());
        }
        let context_path = self.context.path();
        match Path::new(&context_path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.display().to_string(),
            _ => ".".to_string(),
        }
    }

    /// Candidate files, in the host's fixed probe order: the exact path,
    /// then extension inference, then the index file.
    fn probe_candidates(
        &self,
        absolute: &str,
    ) -> Vec<String> {
        let mut candidates = Vec::new();
        if Path::new(absolute).is_file() {
            candidates.push(absolute.to_string());
        }
        let with_extension = format!("{}.{}", absolute, self.extension);
        if Path::new(&with_extension).is_file() {
            candidates.push(with_extension);
        }
        let index = format!("{}/init.{}", absolute, self.extension);
        if Path::new(&index).is_file() {
            candidates.push(index);
        }
        candidates
    }
}

fn join_paths(
    base: &str,
    request: &str,
) -> String {
    if request.starts_with('/') {
        request.to_string()
    } else {
        format!("{}/{}", base, request)
    }
}

/// Resolve `.` and `..` components textually, without touching the
/// filesystem.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
