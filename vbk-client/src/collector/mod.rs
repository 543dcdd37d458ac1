use std::io::Write;
use std::sync::Arc;

use anyhow::Error;
use tokio_util::sync::CancellationToken;

use vbk_api_types::JobConfig;

mod filesystem;
pub use filesystem::{FilesystemCollector, FilesystemOptions};

mod mysql;
pub use mysql::{MysqlCollector, MysqlOptions};

mod presets;
pub use presets::{PresetsCollector, PresetsOptions};

/// A source of backup bytes. Collectors run synchronously on the
/// producer task and write their output to `writer`; an error closes the
/// stream with that error. Collectors do not retry I/O.
pub trait Collector: Send + Sync {
    fn collect(
        &self,
        job: &str,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;
}

/// Runs its members sequentially, concatenating their output.
pub struct CompositeCollector {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CompositeCollector {
    pub fn new(collectors: Vec<Arc<dyn Collector>>) -> Self {
        Self { collectors }
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

impl Collector for CompositeCollector {
    fn collect(
        &self,
        job: &str,
        writer: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        for collector in &self.collectors {
            collector.collect(job, writer, cancel)?;
        }
        Ok(())
    }
}

/// Build the composite collector for a job (mysql, presets, filesystem
/// paths, in registration order). `None` when no sources are configured.
pub fn collector_for_job(job: &JobConfig) -> Option<Arc<dyn Collector>> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();

    if let Some(mysql) = &job.mysql {
        if mysql.enabled {
            collectors.push(Arc::new(MysqlCollector::new(MysqlOptions::from_config(mysql))));
        }
    }

    if let Some(presets) = &job.presets {
        if presets.any() {
            collectors.push(Arc::new(PresetsCollector::new(PresetsOptions {
                nginx: presets.nginx,
                apache: presets.apache,
                letsencrypt: presets.letsencrypt,
            })));
        }
    }

    if let Some(paths) = &job.paths {
        if !paths.include.is_empty() {
            collectors.push(Arc::new(FilesystemCollector::new(FilesystemOptions {
                include: paths.include.clone(),
                exclude: paths.exclude.clone(),
                follow_symlinks: paths.follow_symlinks,
            })));
        }
    }

    if collectors.is_empty() {
        None
    } else {
        Some(Arc::new(CompositeCollector::new(collectors)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCollector(&'static [u8]);

    impl Collector for StaticCollector {
        fn collect(
            &self,
            _job: &str,
            writer: &mut dyn Write,
            _cancel: &CancellationToken,
        ) -> Result<(), Error> {
            writer.write_all(self.0)?;
            Ok(())
        }
    }

    #[test]
    fn test_composite_concatenates_in_order() {
        let composite = CompositeCollector::new(vec![
            Arc::new(StaticCollector(b"first,")),
            Arc::new(StaticCollector(b"second")),
        ]);
        let mut out = Vec::new();
        composite.collect("job", &mut out, &CancellationToken::new()).unwrap();
        assert_eq!(out, b"first,second");
    }

    #[test]
    fn test_collector_for_job_empty() {
        let job = JobConfig::new("empty");
        assert!(collector_for_job(&job).is_none());
    }

    #[test]
    fn test_collector_for_job_with_paths() {
        let mut job = JobConfig::new("files");
        job.paths = Some(vbk_api_types::PathsConfig {
            include: vec!["/var/backup".to_string()],
            exclude: Vec::new(),
            follow_symlinks: false,
        });
        assert!(collector_for_job(&job).is_some());
    }
}
