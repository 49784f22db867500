//! Master configuration file schema
//!
//! The master consumes one JSON file with a `signals` array (channel
//! records) and a `runtime_settings` object. Loading goes through
//! figment so individual settings can be overridden from the
//! environment (`LOOPSIM_` prefix) without editing the file.

use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::channel::ChannelCatalog;
use crate::entry::SignalKind;

// ============================================================================
// Default value functions (used by serde defaults)
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_error_stack_max_len() -> u32 {
    20
}

fn default_boxcar_length() -> u32 {
    5
}

fn default_poll_buffer_period_ms() -> u64 {
    200
}

fn default_socket_timeout_s() -> f64 {
    3.0
}

// ============================================================================
// Configuration records
// ============================================================================

/// One channel record from the `signals` array. Field names mirror the
/// deployed configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub name: String,
    #[serde(rename = "boardSlotPosition")]
    pub board_slot_position: u32,
    pub sig_type: SignalKind,
    #[serde(rename = "engineeringUnits", default)]
    pub engineering_units: Option<String>,
    #[serde(rename = "engineeringUnitsLowAmount", default)]
    pub engineering_units_low_amount: f64,
    #[serde(rename = "engineeringUnitsHighAmount", default)]
    pub engineering_units_high_amount: f64,
    #[serde(rename = "showOnGUI", default = "default_true")]
    pub show_on_gui: bool,
    #[serde(default)]
    pub offset_calib_constant: Option<f64>,
    #[serde(default)]
    pub slope_calib_constant: Option<f64>,
}

/// Runtime tuning knobs. All floors are clamped at load rather than
/// rejected, matching how operators actually edit these files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Operator error stack depth (>= 1)
    #[serde(default = "default_error_stack_max_len")]
    pub error_stack_max_len: u32,
    /// Lowers the default log filter to debug
    #[serde(default = "default_true")]
    pub enable_verbose_logging: bool,
    /// Samples averaged per AI poll (>= 1)
    #[serde(rename = "ai_LPF_boxcar_length", default = "default_boxcar_length")]
    pub ai_lpf_boxcar_length: u32,
    /// Input poll period in milliseconds (>= 1)
    #[serde(default = "default_poll_buffer_period_ms")]
    pub poll_buffer_period_ms: u64,
    /// Connect/read timeout in seconds (>= 0)
    #[serde(default = "default_socket_timeout_s")]
    pub socket_timeout_s: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            error_stack_max_len: default_error_stack_max_len(),
            enable_verbose_logging: true,
            ai_lpf_boxcar_length: default_boxcar_length(),
            poll_buffer_period_ms: default_poll_buffer_period_ms(),
            socket_timeout_s: default_socket_timeout_s(),
        }
    }
}

impl RuntimeSettings {
    fn clamped(mut self) -> Self {
        if self.error_stack_max_len < 1 {
            warn!("error_stack_max_len below 1, clamping");
            self.error_stack_max_len = 1;
        }
        if self.ai_lpf_boxcar_length < 1 {
            warn!("ai_LPF_boxcar_length below 1, clamping");
            self.ai_lpf_boxcar_length = 1;
        }
        if self.poll_buffer_period_ms < 1 {
            warn!("poll_buffer_period_ms below 1, clamping");
            self.poll_buffer_period_ms = 1;
        }
        if self.socket_timeout_s < 0.0 {
            warn!("socket_timeout_s below 0, clamping");
            self.socket_timeout_s = 0.0;
        }
        self
    }

    pub fn socket_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.socket_timeout_s)
    }

    pub fn poll_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_buffer_period_ms)
    }
}

/// Top-level master configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub signals: Vec<SignalRecord>,
    #[serde(default)]
    pub runtime_settings: Option<RuntimeSettings>,
}

impl MasterConfig {
    /// Load from a JSON file with `LOOPSIM_` environment overrides
    /// (e.g. `LOOPSIM_RUNTIME_SETTINGS.SOCKET_TIMEOUT_S=5`).
    pub fn load(path: &str) -> Result<Self, figment::Error> {
        let config: MasterConfig = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("LOOPSIM_").split("."))
            .extract()?;
        Ok(config)
    }

    /// Runtime settings with documented defaults and floors applied.
    pub fn settings(&self) -> RuntimeSettings {
        self.runtime_settings.clone().unwrap_or_default().clamped()
    }

    /// Build the channel catalog from the `signals` array.
    pub fn catalog(&self) -> ChannelCatalog {
        for record in &self.signals {
            if crate::channel::pin_for_slot(record.board_slot_position).is_none() {
                warn!(
                    "signal {} references board slot {} with no pin mapping; enqueues for it will be rejected",
                    record.name, record.board_slot_position
                );
            }
        }
        ChannelCatalog::from_records(&self.signals)
    }
}
