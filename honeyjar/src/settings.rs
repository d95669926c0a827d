use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::program::RunOptions;
use crate::reader::PerfReaderOptions;
use crate::sys;

const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const ENV_PREFIX: &str = "HONEYJAR";

/// Test-run configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RunSettings {
    pub repeat: Option<u32>,
    pub cpu: Option<u32>,
}

/// Event reader configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReaderSettings {
    pub timeout_ms: Option<u64>,
    pub perf_buffer_bytes: Option<usize>,
    pub ring_size_bytes: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub reader: ReaderSettings,
    pub bump_memlock: Option<bool>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Reads `.env`, then an optional YAML file, then `HONEYJAR_*` variables
    /// (`__` separates nesting, e.g. `HONEYJAR_READER__TIMEOUT_MS`).
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        let s = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.reader.timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS))
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            repeat: self.run.repeat.unwrap_or(1).max(1),
            cpu: self.run.cpu,
            context: None,
        }
    }

    pub fn perf_options(&self) -> PerfReaderOptions {
        let mut opts = PerfReaderOptions::default();
        if let Some(bytes) = self.reader.perf_buffer_bytes {
            opts.per_cpu_buffer = bytes;
        }
        opts
    }

    /// Ring buffer size for scenarios; one page unless configured.
    pub fn ring_size(&self) -> u32 {
        self.reader
            .ring_size_bytes
            .unwrap_or(sys::page_size() as u32)
    }

    pub fn bump_memlock(&self) -> bool {
        self.bump_memlock.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_load_settings() {
        unsafe {
            std::env::set_var("HONEYJAR_RUN__REPEAT", "5");
            std::env::set_var("HONEYJAR_READER__TIMEOUT_MS", "250");
            std::env::set_var("HONEYJAR_BUMP_MEMLOCK", "false");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert_eq!(settings.run.repeat, Some(5));
        assert_eq!(settings.reader.timeout_ms, Some(250));
        assert_eq!(settings.read_timeout(), Duration::from_millis(250));
        assert!(!settings.bump_memlock());
        assert_eq!(settings.run_options().repeat, 5);

        unsafe {
            std::env::remove_var("HONEYJAR_RUN__REPEAT");
            std::env::remove_var("HONEYJAR_READER__TIMEOUT_MS");
            std::env::remove_var("HONEYJAR_BUMP_MEMLOCK");
        }
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let path = std::env::temp_dir().join(format!("honeyjar-settings-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "reader:\n  timeout_ms: 10\n  ring_size_bytes: 16384\nrun:\n  cpu: 1").unwrap();

        unsafe {
            std::env::set_var("HONEYJAR_READER__TIMEOUT_MS", "20");
        }
        let settings = Settings::load(Some(&path)).expect("Failed to load settings");
        unsafe {
            std::env::remove_var("HONEYJAR_READER__TIMEOUT_MS");
        }
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.reader.timeout_ms, Some(20));
        assert_eq!(settings.ring_size(), 16384);
        assert_eq!(settings.run_options().cpu, Some(1));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.read_timeout(), Duration::from_millis(DEFAULT_READ_TIMEOUT_MS));
        assert_eq!(settings.run_options().repeat, 1);
        assert_eq!(settings.ring_size(), sys::page_size() as u32);
        assert_eq!(settings.perf_options().per_cpu_buffer, sys::page_size());
        assert!(settings.bump_memlock());
    }
}
