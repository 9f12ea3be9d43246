//! Source file access restricted to a set of authorized roots.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::{
    backend::DebugBackend,
    dispatch::{decode, error_response},
    error::GatewayError,
    gateway::Gateway,
};

const TARGET: &str = "dbgate.sandbox";

/// Directories whose files may be served, stored in canonical form.
#[derive(Debug, Clone)]
pub struct AuthorizedPaths {
    /// Relative request paths resolve against this directory.
    base: PathBuf,
    roots: Vec<PathBuf>,
}

impl AuthorizedPaths {
    /// Roots that do not exist are skipped with a warning; relative roots resolve
    /// against `base`.
    pub fn new(base: impl Into<PathBuf>, roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let base = base.into();
        let base = std::fs::canonicalize(&base).unwrap_or(base);
        let mut canonical: Vec<PathBuf> = Vec::new();
        for root in roots {
            let absolute = base.join(&root);
            match std::fs::canonicalize(&absolute) {
                Ok(root) => {
                    if !canonical.contains(&root) {
                        canonical.push(root);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: TARGET,
                        root = %absolute.display(),
                        error = %err,
                        "ignoring unusable source root"
                    );
                }
            }
        }
        Self {
            base,
            roots: canonical,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolves `requested` to a canonical path inside one of the roots.
    ///
    /// Symlinks are followed before the check, so a link pointing out of a root
    /// is rejected. Only canonical paths are ever returned: a path that does not
    /// exist is a read error when it would fall inside a root and illegal otherwise.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, GatewayError> {
        if requested.is_empty() {
            return Err(GatewayError::NoPath);
        }
        let joined = self.base.join(requested);
        let resolved = match tokio::fs::canonicalize(&joined).await {
            Ok(path) => path,
            Err(err) => {
                return match nearest_existing(&joined).await {
                    Some(path) if self.contains(&path) => Err(GatewayError::FileRead(err)),
                    _ => Err(self.refuse(&joined)),
                };
            }
        };

        if self.contains(&resolved) {
            Ok(resolved)
        } else {
            Err(self.refuse(&resolved))
        }
    }

    fn contains(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    fn refuse(&self, path: &Path) -> GatewayError {
        tracing::warn!(target: TARGET, path = %path.display(), "refusing file outside source roots");
        GatewayError::IllegalFileAccess
    }
}

/// Canonicalizes the deepest existing ancestor of `path` and appends the rest.
///
/// Returns `None` when the missing tail still contains `..` or similar, since
/// those cannot be resolved without the directories they walk through.
async fn nearest_existing(path: &Path) -> Option<PathBuf> {
    for ancestor in path.ancestors().skip(1) {
        let Ok(canonical) = tokio::fs::canonicalize(ancestor).await else {
            continue;
        };
        let rest = path.strip_prefix(ancestor).ok()?;
        if rest
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return None;
        }
        return Some(canonical.join(rest));
    }
    None
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct FileGetParams {
    file: String,
}

pub(crate) async fn file_get<B: DebugBackend>(
    State(gateway): State<Arc<Gateway<B>>>,
    body: Bytes,
) -> Response {
    let params = match decode::<FileGetParams>(&body) {
        Ok(params) => params,
        Err(err) => return error_response(err),
    };
    let path = match gateway.sandbox().resolve(&params.file).await {
        Ok(path) => path,
        Err(err) => return error_response(err),
    };
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => return error_response(GatewayError::FileRead(err)),
    };

    tracing::debug!(target: TARGET, path = %path.display(), "serving file");
    let stream = ReaderStream::new(file).inspect_err(move |err| {
        tracing::warn!(target: TARGET, path = %path.display(), error = %err, "file read failed mid-stream");
    });
    ([(CONTENT_TYPE, "application/octet-stream")], Body::from_stream(stream)).into_response()
}
