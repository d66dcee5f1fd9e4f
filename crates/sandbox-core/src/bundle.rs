//! Service bundles uploaded into build containers.
//!
//! A bundle is a tar archive unpacked at the service's extract path. It holds
//! the files shared by the whole application, the service's own archives and
//! a nested `service.tar` with the generated files describing the service
//! (`environment.json`, `environment.yml`, `dotcloud_profile`,
//! `definition.json`). Entries are stored under their base names.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::SandboxConfig;
use crate::container::bytes_to_human;
use crate::service::{Application, ServiceConfig};

/// Errors produced while rendering bundles.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("file to upload not found: {}", .path.display())]
    MissingFile { path: PathBuf },

    #[error("can't upload {}: no file name", .path.display())]
    NoFileName { path: PathBuf },

    #[error("two files would be uploaded as {name}")]
    DuplicateEntry { name: String },

    #[error("bundle task failed: {0}")]
    Task(String),
}

/// Name of the nested archive holding the generated service files.
pub const SERVICE_ARCHIVE: &str = "service.tar";

/// Result type for bundle operations.
pub type Result<T> = std::result::Result<T, BundleError>;

/// Produces the archives uploaded during a build.
#[async_trait]
pub trait BundleRenderer: Send + Sync {
    /// Files shared by every service; rendered once per build.
    async fn render_application(
        &self,
        application: &Application,
        build_dir: &Path,
    ) -> Result<Vec<PathBuf>>;

    /// The archive uploaded into one service's container.
    async fn render_service(
        &self,
        application: &Application,
        service: &ServiceConfig,
        build_dir: &Path,
        app_files: &[PathBuf],
    ) -> Result<PathBuf>;
}

/// [`BundleRenderer`] writing plain tar archives.
#[derive(Debug, Clone, Default)]
pub struct TarBundler {
    config: SandboxConfig,
}

impl TarBundler {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BundleRenderer for TarBundler {
    #[instrument(skip_all, fields(application = %application.name))]
    async fn render_application(
        &self,
        application: &Application,
        _build_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut total = 0;
        for path in &application.upload_files {
            match tokio::fs::metadata(path).await {
                Ok(metadata) if metadata.is_file() => total += metadata.len(),
                _ => return Err(BundleError::MissingFile { path: path.clone() }),
            }
        }
        debug!(
            files = application.upload_files.len(),
            size = %bytes_to_human(total),
            "application files ready"
        );
        Ok(application.upload_files.clone())
    }

    #[instrument(skip_all, fields(service = %service.name))]
    async fn render_service(
        &self,
        application: &Application,
        service: &ServiceConfig,
        build_dir: &Path,
        app_files: &[PathBuf],
    ) -> Result<PathBuf> {
        let service_dir = build_dir.join(&service.name);
        tokio::fs::create_dir_all(&service_dir).await?;

        let env = service.full_environment(application, &self.config);
        let generated = [
            ("environment.json", serde_json::to_vec_pretty(&env)?),
            ("environment.yml", serde_yaml::to_string(&env)?.into_bytes()),
            ("dotcloud_profile", render_profile(env.iter()).into_bytes()),
            ("definition.json", serde_json::to_vec_pretty(service)?),
        ];
        let mut service_files = Vec::with_capacity(generated.len());
        for (name, contents) in generated {
            let path = service_dir.join(name);
            tokio::fs::write(&path, contents).await?;
            service_files.push(path);
        }

        let service_archive = service_dir.join(SERVICE_ARCHIVE);
        let mut files: Vec<PathBuf> = app_files.to_vec();
        files.extend(service.upload_archives.iter().cloned());
        files.push(service_archive.clone());

        let dest = build_dir.join(format!("{}.tar", service.name));
        let archive = dest.clone();
        tokio::task::spawn_blocking(move || {
            write_tar(&service_archive, &service_files)?;
            write_tar(&archive, &files)
        })
        .await
        .map_err(|e| BundleError::Task(e.to_string()))??;

        debug!(bundle = %dest.display(), "service bundle rendered");
        Ok(dest)
    }
}

fn write_tar(dest: &Path, files: &[PathBuf]) -> Result<()> {
    let mut names = BTreeSet::new();
    let mut builder = tar::Builder::new(File::create(dest)?);
    for path in files {
        let name = path
            .file_name()
            .ok_or_else(|| BundleError::NoFileName { path: path.clone() })?;
        if !names.insert(name.to_os_string()) {
            return Err(BundleError::DuplicateEntry {
                name: name.to_string_lossy().into_owned(),
            });
        }
        if !path.is_file() {
            return Err(BundleError::MissingFile { path: path.clone() });
        }
        builder.append_path_with_name(path, name)?;
    }
    builder.into_inner()?.sync_all()?;
    Ok(())
}

fn render_profile<'a>(env: impl Iterator<Item = (&'a String, &'a String)>) -> String {
    env.map(|(key, value)| format!("export {key}='{}'\n", value.replace('\'', r"'\''")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn entries(archive: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(archive).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn entry_contents(archive: &[u8], name: &str) -> Vec<u8> {
        let mut archive = tar::Archive::new(archive);
        let mut entry = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap())
            .find(|entry| entry.path().unwrap().to_string_lossy() == name)
            .unwrap_or_else(|| panic!("no {name} in archive"));
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        contents
    }

    #[tokio::test]
    async fn test_service_bundle_contents() {
        let dir = tempfile::tempdir().unwrap();
        let app_tar = dir.path().join("application.tar");
        let extra = dir.path().join("wheels.tar");
        std::fs::write(&app_tar, b"app").unwrap();
        std::fs::write(&extra, b"wheels").unwrap();

        let mut app = Application::new("ramen");
        app.upload_files.push(app_tar.clone());
        let mut service = ServiceConfig::new("api", "python");
        service.upload_archives.push(extra);
        app.services.push(service.clone());

        let bundler = TarBundler::default();
        let build_dir = dir.path().join("build");
        std::fs::create_dir(&build_dir).unwrap();
        let app_files = bundler.render_application(&app, &build_dir).await.unwrap();
        assert_eq!(app_files, vec![app_tar]);

        let bundle = bundler
            .render_service(&app, &service, &build_dir, &app_files)
            .await
            .unwrap();
        assert_eq!(bundle, build_dir.join("api.tar"));
        assert_eq!(
            entries(&bundle),
            vec!["application.tar", "wheels.tar", "service.tar"]
        );

        let bundle_bytes = std::fs::read(&bundle).unwrap();
        let service_tar = entry_contents(&bundle_bytes, "service.tar");
        let generated = dir.path().join("service.tar");
        std::fs::write(&generated, &service_tar).unwrap();
        assert_eq!(
            entries(&generated),
            vec![
                "environment.json",
                "environment.yml",
                "dotcloud_profile",
                "definition.json"
            ]
        );

        let env: BTreeMap<String, String> =
            serde_json::from_slice(&entry_contents(&service_tar, "environment.json")).unwrap();
        assert_eq!(env["DOTCLOUD_SERVICE_NAME"], "api");
        let env_yml: BTreeMap<String, String> =
            serde_yaml::from_slice(&entry_contents(&service_tar, "environment.yml")).unwrap();
        assert_eq!(env_yml, env);
    }

    #[tokio::test]
    async fn test_missing_application_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = Application::new("ramen");
        app.upload_files.push(dir.path().join("missing.tar"));

        let err = TarBundler::default()
            .render_application(&app, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::MissingFile { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_base_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("a").join("code.tar"), b"a").unwrap();
        std::fs::write(dir.path().join("b").join("code.tar"), b"b").unwrap();

        let app = Application::new("ramen");
        let mut service = ServiceConfig::new("api", "python");
        service.upload_archives.push(dir.path().join("b").join("code.tar"));

        let err = TarBundler::default()
            .render_service(
                &app,
                &service,
                dir.path(),
                &[dir.path().join("a").join("code.tar")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::DuplicateEntry { ref name } if name == "code.tar"));
    }

    #[test]
    fn test_profile_quotes_values() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "it's".to_string());
        env.insert("B".to_string(), "x y".to_string());
        assert_eq!(
            render_profile(env.iter()),
            "export A='it'\\''s'\nexport B='x y'\n"
        );
    }
}
