//! Handles to images resolved in the engine.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::container::Container;
use crate::engine::{argv, check_output, Engine, EngineError};
use crate::revspec::{RevisionSpec, RevisionSpecError};

/// Errors produced by image operations.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image {spec} not found")]
    NotFound { spec: String },

    /// The handle was invalidated by [`Image::destroy`].
    #[error("image destroyed, can't {operation}")]
    Destroyed { operation: &'static str },

    #[error("image {image} has no repository and can't be tagged")]
    NoRepository { image: String },

    #[error("image {image} has no resolved revision")]
    Unresolved { image: String },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    RevisionSpec(#[from] RevisionSpecError),
}

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// An image known to exist in the engine.
///
/// The revision spec carried by a handle always has its revision resolved. Two
/// handles can share a revision (e.g. after [`Image::add_tag`]); destroying
/// one removes the revision from the engine for both, even though only the
/// destroyed handle knows it.
#[derive(Clone)]
pub struct Image {
    engine: Arc<dyn Engine>,
    spec: Option<RevisionSpec>,
}

impl Image {
    pub(crate) fn from_resolved(engine: Arc<dyn Engine>, spec: RevisionSpec) -> Self {
        Self {
            engine,
            spec: Some(spec),
        }
    }

    /// Resolve `spec` against the engine's image listing.
    ///
    /// Listing lines that don't parse are skipped with a warning; the first
    /// matching image wins.
    #[instrument(skip_all, fields(spec = %spec))]
    pub async fn lookup(engine: Arc<dyn Engine>, spec: &RevisionSpec) -> Result<Self> {
        let listing = check_output(engine.as_ref(), &argv(&["images"])).await?;
        let listing = String::from_utf8_lossy(&listing);

        for line in listing.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let candidate = match RevisionSpec::parse_from_engine_listing(line) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(line, error = %e, "skipping unparsable image listing line");
                    continue;
                }
            };
            if *spec == candidate {
                debug!(resolved = %candidate, "image found");
                return Ok(Self::from_resolved(engine, candidate));
            }
        }

        Err(ImageError::NotFound {
            spec: spec.to_string(),
        })
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn is_destroyed(&self) -> bool {
        self.spec.is_none()
    }

    pub fn spec(&self) -> Result<&RevisionSpec> {
        self.spec
            .as_ref()
            .ok_or(ImageError::Destroyed { operation: "read spec" })
    }

    pub fn revision(&self) -> Result<&str> {
        let spec = self.spec()?;
        spec.revision().ok_or_else(|| ImageError::Unresolved {
            image: spec.to_string(),
        })
    }

    /// Create a container from this image.
    ///
    /// The container commits into `commit_as` when it exits; with `None` it
    /// commits back into this image's repository and tag.
    pub fn instantiate(&self, commit_as: Option<RevisionSpec>) -> Result<Container> {
        if self.is_destroyed() {
            return Err(ImageError::Destroyed {
                operation: "instantiate",
            });
        }
        Ok(Container::new(self.clone(), commit_as))
    }

    /// Remove the image revision from the engine and invalidate this handle.
    pub async fn destroy(&mut self) -> Result<()> {
        let revision = match &self.spec {
            Some(_) => self.revision()?.to_string(),
            None => return Err(ImageError::Destroyed { operation: "destroy" }),
        };
        check_output(self.engine.as_ref(), &argv(&["rmi", revision.as_str()])).await?;
        debug!(%revision, "image destroyed");
        self.spec = None;
        Ok(())
    }

    /// Tag this image's revision with `tag`, returning a handle for the new tag.
    pub async fn add_tag(&self, tag: &str) -> Result<Image> {
        let spec = self
            .spec
            .as_ref()
            .ok_or(ImageError::Destroyed { operation: "add a tag" })?;
        let repository = spec
            .fully_qualified_name()
            .ok_or_else(|| ImageError::NoRepository {
                image: spec.to_string(),
            })?;
        let revision = self.revision()?;

        let target = format!("{repository}:{tag}");
        check_output(self.engine.as_ref(), &argv(&["tag", revision, target.as_str()])).await?;
        debug!(%revision, %target, "image tagged");

        Ok(Self::from_resolved(self.engine.clone(), spec.with_tag(tag)))
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("engine", &self.engine.program())
            .field("spec", &self.spec)
            .finish()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.spec {
            Some(spec) => spec.fmt(f),
            None => f.write_str("<destroyed image>"),
        }
    }
}
