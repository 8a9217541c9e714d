use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

/// Measurement rates the configuration accepts, in Hz.
pub const SUPPORTED_RATES_HZ: [u32; 5] = [1, 2, 3, 6, 10];

pub const ASF_MINIMUM: u8 = 0;
pub const ASF_MAXIMUM: u8 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate device name '{0}'")]
    DuplicateName(String),
    #[error("serial port '{0}' is assigned to more than one device")]
    DuplicatePort(String),
    #[error("balance '{balance}' references unknown reader id {reader_id}")]
    UnknownReader { balance: String, reader_id: u32 },
    #[error("balance '{balance}' references disabled reader '{reader}'")]
    DisabledReader { balance: String, reader: String },
    #[error("reader '{reader}' is paired with more than one enabled balance")]
    SharedReader { reader: String },
    #[error("device '{device}': {problem}")]
    BadField { device: String, problem: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityMode {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial-line parameters for one device.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialParams {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: ParityMode,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub xonxoff: bool,
    #[serde(default)]
    pub rtscts: bool,
    #[serde(default)]
    pub dtrdsr: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    pub id: u32,
    pub name: String,
    #[serde(flatten)]
    pub serial: SerialParams,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceConfig {
    pub id: u32,
    pub name: String,
    #[serde(flatten)]
    pub serial: SerialParams,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// The RFID reader this balance is paired with.
    pub reader_id: u32,
    #[serde(default = "default_rate_hz")]
    pub measurement_rate_hz: u32,
    #[serde(default = "default_stability_n")]
    pub stability_n: usize,
    #[serde(default = "default_tolerance_kg")]
    pub tolerance_kg: f64,
    #[serde(default = "default_min_mass_kg")]
    pub min_mass_kg: f64,
    #[serde(default = "default_unlock_mass_kg")]
    pub unlock_mass_kg: f64,
    #[serde(default = "default_refload_mass_kg")]
    pub refload_mass_kg: f64,
    #[serde(default)]
    pub zero_value: Option<i64>,
    #[serde(default)]
    pub refload_value: Option<i64>,
    #[serde(default = "default_asf_mode")]
    pub amp_signal_filter_mode: u8,
    #[serde(default)]
    pub fast_response_filter: bool,
    #[serde(default)]
    pub read_continuously: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhiskerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub prefix: String,
}

/// The immutable configuration snapshot the supervisor runs from.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub whisker: WhiskerConfig,
    pub rfid_effective_time_s: f64,
    pub event_store: PathBuf,
    #[serde(default)]
    pub control_pipe: Option<PathBuf>,
    #[serde(default, rename = "reader")]
    pub readers: Vec<ReaderConfig>,
    #[serde(default, rename = "balance")]
    pub balances: Vec<BalanceConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn reader(&self, id: u32) -> Option<&ReaderConfig> {
        self.readers.iter().find(|r| r.id == id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rfid_effective_time_s <= 0.0 {
            return Err(ConfigError::Invalid(
                "rfid_effective_time_s must be positive".to_string(),
            ));
        }
        if self.whisker.host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "whisker.host must be non-empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for (name, serial) in self
            .readers
            .iter()
            .map(|r| (&r.name, &r.serial))
            .chain(self.balances.iter().map(|b| (&b.name, &b.serial)))
        {
            if !names.insert(name.clone()) {
                return Err(ConfigError::DuplicateName(name.clone()));
            }
            if !ports.insert(port_key(&serial.port)) {
                return Err(ConfigError::DuplicatePort(serial.port.clone()));
            }
            validate_serial(name, serial)?;
        }

        let mut paired_readers = HashSet::new();
        for balance in self.balances.iter().filter(|b| b.enabled) {
            let reader =
                self.reader(balance.reader_id)
                    .ok_or_else(|| ConfigError::UnknownReader {
                        balance: balance.name.clone(),
                        reader_id: balance.reader_id,
                    })?;
            if !reader.enabled {
                return Err(ConfigError::DisabledReader {
                    balance: balance.name.clone(),
                    reader: reader.name.clone(),
                });
            }
            if !paired_readers.insert(reader.id) {
                return Err(ConfigError::SharedReader {
                    reader: reader.name.clone(),
                });
            }
            validate_balance(balance)?;
        }

        Ok(())
    }
}

fn validate_serial(device: &str, serial: &SerialParams) -> Result<(), ConfigError> {
    let bad = |problem: &str| ConfigError::BadField {
        device: device.to_string(),
        problem: problem.to_string(),
    };
    if serial.port.trim().is_empty() {
        return Err(bad("serial port must be non-empty"));
    }
    if !(5..=8).contains(&serial.data_bits) {
        return Err(bad("data_bits must be between 5 and 8"));
    }
    if !(1..=2).contains(&serial.stop_bits) {
        return Err(bad("stop_bits must be 1 or 2"));
    }
    if serial.xonxoff && serial.rtscts {
        return Err(bad("xonxoff and rtscts are mutually exclusive"));
    }
    Ok(())
}

fn validate_balance(balance: &BalanceConfig) -> Result<(), ConfigError> {
    let bad = |problem: String| ConfigError::BadField {
        device: balance.name.clone(),
        problem,
    };
    if !SUPPORTED_RATES_HZ.contains(&balance.measurement_rate_hz) {
        return Err(bad(format!(
            "measurement_rate_hz must be one of {SUPPORTED_RATES_HZ:?}"
        )));
    }
    if balance.stability_n < 2 {
        return Err(bad("stability_n must be at least 2".to_string()));
    }
    if balance.tolerance_kg <= 0.0 {
        return Err(bad("tolerance_kg must be positive".to_string()));
    }
    if balance.min_mass_kg <= 0.0 {
        return Err(bad("min_mass_kg must be positive".to_string()));
    }
    if balance.unlock_mass_kg <= 0.0 || balance.unlock_mass_kg >= balance.min_mass_kg {
        return Err(bad(
            "unlock_mass_kg must be positive and below min_mass_kg".to_string(),
        ));
    }
    if balance.refload_mass_kg <= 0.0 {
        return Err(bad("refload_mass_kg must be positive".to_string()));
    }
    if let (Some(zero), Some(refload)) = (balance.zero_value, balance.refload_value)
        && zero == refload
    {
        return Err(bad("refload_value must differ from zero_value".to_string()));
    }
    if balance.amp_signal_filter_mode > ASF_MAXIMUM {
        return Err(bad(format!(
            "amp_signal_filter_mode must be between {ASF_MINIMUM} and {ASF_MAXIMUM}"
        )));
    }
    Ok(())
}

/// Serial ports are unique case-insensitively for Windows-style COM names.
fn port_key(port: &str) -> String {
    let upper = port.to_ascii_uppercase();
    if upper.starts_with("COM") && upper.len() > 3 && upper[3..].chars().all(|c| c.is_ascii_digit())
    {
        upper
    } else {
        port.to_string()
    }
}

const fn default_true() -> bool {
    true
}

const fn default_baud() -> u32 {
    9600
}

const fn default_data_bits() -> u8 {
    8
}

const fn default_stop_bits() -> u8 {
    1
}

const fn default_rate_hz() -> u32 {
    6
}

const fn default_stability_n() -> usize {
    5
}

const fn default_tolerance_kg() -> f64 {
    0.005
}

const fn default_min_mass_kg() -> f64 {
    0.050
}

const fn default_unlock_mass_kg() -> f64 {
    0.010
}

const fn default_refload_mass_kg() -> f64 {
    0.1
}

const fn default_asf_mode() -> u8 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            rfid_effective_time_s = 5.0
            event_store = "/tmp/starfeeder-events"

            [whisker]
            host = "localhost"
            port = 3233
            prefix = "sf: "

            [[reader]]
            id = 1
            name = "reader-left"
            port = "/dev/ttyUSB0"
            xonxoff = true

            [[balance]]
            id = 2
            name = "balance-left"
            port = "/dev/ttyUSB1"
            parity = "even"
            xonxoff = true
            reader_id = 1
            measurement_rate_hz = 3
            stability_n = 3
            tolerance_kg = 0.001
            min_mass_kg = 0.050
            unlock_mass_kg = 0.010
            refload_mass_kg = 0.1
        "#
    }

    fn parse(toml_text: &str) -> Config {
        toml::from_str(toml_text).expect("config should parse")
    }

    #[test]
    fn sample_config_is_valid() {
        let config = parse(sample_toml());
        config.validate().expect("sample config should validate");
        assert_eq!(config.readers.len(), 1);
        assert_eq!(config.balances[0].reader_id, 1);
        assert_eq!(config.balances[0].serial.parity, ParityMode::Even);
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut config = parse(sample_toml());
        config.balances[0].name = "reader-left".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateName(_))
        ));
    }

    #[test]
    fn rejects_windows_ports_differing_only_in_case() {
        let mut config = parse(sample_toml());
        config.readers[0].serial.port = "COM3".to_string();
        config.balances[0].serial.port = "com3".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePort(_))
        ));
    }

    #[test]
    fn unix_ports_are_case_sensitive() {
        let mut config = parse(sample_toml());
        config.readers[0].serial.port = "/dev/ttyUSB2".to_string();
        config.balances[0].serial.port = "/dev/ttyusb2".to_string();
        config.validate().expect("distinct unix ports should pass");
    }

    #[test]
    fn rejects_shared_reader() {
        let mut config = parse(sample_toml());
        let mut second = config.balances[0].clone();
        second.id = 3;
        second.name = "balance-right".to_string();
        second.serial.port = "/dev/ttyUSB2".to_string();
        config.balances.push(second);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedReader { .. })
        ));
    }

    #[test]
    fn rejects_unknown_reader() {
        let mut config = parse(sample_toml());
        config.balances[0].reader_id = 99;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownReader { .. })
        ));
    }

    #[test]
    fn rejects_unlock_at_or_above_min_mass() {
        let mut config = parse(sample_toml());
        config.balances[0].unlock_mass_kg = 0.050;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadField { .. })
        ));
    }

    #[test]
    fn rejects_unsupported_rate() {
        let mut config = parse(sample_toml());
        config.balances[0].measurement_rate_hz = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadField { .. })
        ));
    }

    #[test]
    fn rejects_equal_calibration_points() {
        let mut config = parse(sample_toml());
        config.balances[0].zero_value = Some(100);
        config.balances[0].refload_value = Some(100);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadField { .. })
        ));
    }

    #[test]
    fn disabled_balance_skips_pairing_checks() {
        let mut config = parse(sample_toml());
        config.balances[0].enabled = false;
        config.balances[0].reader_id = 99;
        config
            .validate()
            .expect("disabled balance should not be checked");
    }
}
