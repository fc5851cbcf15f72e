use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use jobstats_data::efficiency::{GradingOptions, ResourceThresholds, Thresholds};
use jobstats_data::rollup::RollupOptions;

const SYSTEM_CONFIG: &str = "/etc/jobstats/config.toml";
const ENV_PREFIX: &str = "JOBSTATS";
const DEFAULT_WEIGHT: i64 = 1;
const THRESHOLD_KEYS: [&str; 4] = ["memory_thresholds", "cpu_thresholds", "time_thresholds", "gpu_thresholds"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub hard_memory_cap: bool,
    pub show_step_children: bool,
    pub memory_weight: u32,
    pub cpu_weight: u32,
    pub track_single_core_jobs: bool,
    pub memory_thresholds: Thresholds,
    pub cpu_thresholds: Thresholds,
    pub time_thresholds: Thresholds,
    pub gpu_thresholds: Thresholds,
}

impl Settings {
    /// Defaults, then the system file, then `path`, then `JOBSTATS_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(Path::new(SYSTEM_CONFIG), path)
    }

    fn load_from(system: &Path, path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = GradingOptions::default();
        let mut builder = Config::builder()
            .set_default("hard_memory_cap", defaults.hard_memory_cap)?
            .set_default("show_step_children", false)?
            .set_default("memory_weight", DEFAULT_WEIGHT)?
            .set_default("cpu_weight", DEFAULT_WEIGHT)?
            .set_default("track_single_core_jobs", defaults.track_single_core_jobs)?;
        for key in THRESHOLD_KEYS {
            builder = builder.set_default(key, Vec::<f64>::from(Thresholds::default()))?;
        }

        builder = builder.add_source(File::from(system).format(FileFormat::Toml).required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",");
        for key in THRESHOLD_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        builder.add_source(environment).build()?.try_deserialize()
    }

    pub fn rollup_options(&self, show_children: bool, sample_running: bool) -> RollupOptions {
        RollupOptions {
            show_step_children: self.show_step_children || show_children,
            sample_running,
        }
    }

    pub fn grading_options(&self, report_gpu: bool) -> GradingOptions {
        GradingOptions {
            hard_memory_cap: self.hard_memory_cap,
            track_single_core_jobs: self.track_single_core_jobs,
            memory_weight: self.memory_weight,
            cpu_weight: self.cpu_weight,
            report_gpu,
            thresholds: ResourceThresholds {
                memory: self.memory_thresholds,
                cpu: self.cpu_thresholds,
                time: self.time_thresholds,
                gpu: self.gpu_thresholds,
            },
        }
    }
}
