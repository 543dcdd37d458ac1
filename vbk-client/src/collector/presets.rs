use std::io::Write;
use std::path::Path;

use anyhow::Error;
use tokio_util::sync::CancellationToken;

use super::{Collector, FilesystemCollector, FilesystemOptions};

pub const PRESET_PATH_NGINX: &str = "/etc/nginx";
pub const PRESET_PATH_APACHE: &str = "/etc/apache2";
pub const PRESET_PATH_APACHE_ALT: &str = "/etc/httpd";
pub const PRESET_PATH_LETSENCRYPT: &str = "/etc/letsencrypt";

#[derive(Clone, Copy, Debug, Default)]
pub struct PresetsOptions {
    pub nginx: bool,
    pub apache: bool,
    pub letsencrypt: bool,
}

/// Well-known web server configuration directories, collected with the
/// filesystem collector. Directories that do not exist on this host are
/// silently left out.
pub struct PresetsCollector {
    options: PresetsOptions,
}

impl PresetsCollector {
    pub fn new(options: PresetsOptions) -> Self {
        Self { options }
    }

    fn included_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if self.options.nginx && Path::new(PRESET_PATH_NGINX).exists() {
            paths.push(PRESET_PATH_NGINX.to_string());
        }
        if self.options.apache {
            if Path::new(PRESET_PATH_APACHE).exists() {
                paths.push(PRESET_PATH_APACHE.to_string());
            } else if Path::new(PRESET_PATH_APACHE_ALT).exists() {
                paths.push(PRESET_PATH_APACHE_ALT.to_string());
            }
        }
        if self.options.letsencrypt && Path::new(PRESET_PATH_LETSENCRYPT).exists() {
            paths.push(PRESET_PATH_LETSENCRYPT.to_string());
        }
        paths
    }
}

impl Collector for PresetsCollector {
    fn collect(
        &self,
        job: &str,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let include = self.included_paths();
        if include.is_empty() {
            return Ok(());
        }
        let filesystem = FilesystemCollector::new(FilesystemOptions {
            include,
            exclude: Vec::new(),
            follow_symlinks: false,
        });
        filesystem.collect(job, writer, cancel)
    }
}
