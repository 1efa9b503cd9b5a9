use std::fs;
use std::path::Path;

use filepush::{PumpConfig, RecorderConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};

/// File-level configuration; command-line flags override individual fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pump: PumpConfig,
    pub recorder: RecorderConfig,
}

impl AppConfig {
    /// Load from `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content).map_err(|source| AppError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_path_gives_defaults() {
        assert_eq!(AppConfig::load(None).unwrap(), AppConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "pump": {{ "stream_mode": true, "eof_retry_delay_ms": 200 }},
                 "recorder": {{ "session": {{ "protocol": "rtsp_tcp", "session_id": 42 }} }} }}"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert!(config.pump.stream_mode);
        assert_eq!(config.pump.eof_retry_delay_ms, 200);
        assert_eq!(config.pump.block_size, 188);
        assert!(config.recorder.session.protocol.is_interleaved());
        assert_eq!(config.recorder.session.session_id, 42);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
    }
}
