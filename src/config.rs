use crate::acquisition::AcquisitionSettings;
use crate::datalog::DataLoggerSettings;
use crate::session::SessionSettings;
use crate::simulator::SimulatorSettings;
use confique::Config;
use log::LevelFilter;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub device: DeviceSettings,
    #[config(nested)]
    pub acquisition: AcquisitionConf,
    #[config(nested)]
    pub session: SessionConf,
    #[config(nested)]
    pub data_logging: DataLoggingConf,
    #[config(nested)]
    pub logging: LoggingConf,
}

#[derive(Config, Debug, Clone)]
pub struct DeviceSettings {
    #[config(default = "SIM::0::INSTR")]
    pub resource: String,
    #[config(default = 4096)]
    pub transform_length: u32,
    #[config(default = false)]
    pub complex: bool,
    /// Effective sample rate in samples per second.
    #[config(default = 40960000.0)]
    pub sample_rate: f64,
    #[config(default = 1000)]
    pub num_averages: u32,
    #[config(default = true)]
    pub continuous: bool,
    #[config(default = 300)]
    pub tone_bin: usize,
    #[config(default = 1000.0)]
    pub tone_amplitude: f64,
    #[config(default = 1.0)]
    pub noise_floor: f64,
    #[config(default = 24301)]
    pub seed: u64,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionConf {
    #[config(default = 50)]
    pub idle_poll_ms: u64,
    #[config(default = 1)]
    pub min_poll_interval_ms: u64,
    #[config(default = 1000)]
    pub max_poll_interval_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct SessionConf {
    #[config(default = 20)]
    pub command_poll_ms: u64,
    #[config(default = 50)]
    pub data_wait_ms: u64,
    #[config(default = 2000)]
    pub store_timeout_ms: u64,
    #[config(default = 5000)]
    pub disconnect_timeout_ms: u64,
    #[config(default = 1000)]
    pub heartbeat_interval_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct DataLoggingConf {
    #[config(default = false)]
    pub enabled: bool,
    #[config(default = ".")]
    pub output_dir: String,
    #[config(default = 100)]
    pub max_measurements_per_acq: usize,
    #[config(default = 50)]
    pub poll_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct LoggingConf {
    #[config(default = "info")]
    pub level: LogLevel,
    #[config(default = "spectro_daq.log")]
    pub file: String,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl Conf {
    /// Loads `path` on top of the built-in defaults. A missing file yields
    /// the defaults.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, confique::Error> {
        let mut builder = Conf::builder();
        if let Some(path) = path {
            builder = builder.file(path);
        }
        builder.load()
    }

    pub fn simulator_settings(&self) -> SimulatorSettings {
        let d = &self.device;
        SimulatorSettings {
            resource: d.resource.clone(),
            transform_length: d.transform_length,
            is_complex: d.complex,
            sample_rate: d.sample_rate,
            num_averages: d.num_averages,
            continuous: d.continuous,
            tone_bin: d.tone_bin,
            tone_amplitude: d.tone_amplitude,
            noise_floor: d.noise_floor,
            seed: d.seed,
        }
    }

    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        let a = &self.acquisition;
        AcquisitionSettings {
            idle_poll: Duration::from_millis(a.idle_poll_ms),
            min_poll_interval: Duration::from_millis(a.min_poll_interval_ms),
            max_poll_interval: Duration::from_millis(a.max_poll_interval_ms),
        }
    }

    pub fn logger_settings(&self) -> DataLoggerSettings {
        DataLoggerSettings {
            max_measurements_per_acq: self.data_logging.max_measurements_per_acq,
            poll: Duration::from_millis(self.data_logging.poll_ms),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        let s = &self.session;
        SessionSettings {
            enable_data_logging: self.data_logging.enabled,
            command_poll: Duration::from_millis(s.command_poll_ms),
            data_wait: Duration::from_millis(s.data_wait_ms),
            store_timeout: Duration::from_millis(s.store_timeout_ms),
            disconnect_timeout: Duration::from_millis(s.disconnect_timeout_ms),
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            acquisition: self.acquisition_settings(),
            logger: self.logger_settings(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_logging.output_dir)
    }
}
