use crate::types::Config;
use anyhow::Result;
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{CaptureMethod, Config};

    const SAMPLE: &str = r#"
capture:
  method: region
  left: 0
  top: 0
  right: 0
  bottom: 0
template:
  path: marker.png
control:
  combo_limit: 24
debug:
  save_frames: false
  output_dir: debug
logging:
  level: info
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.capture.method, CaptureMethod::Region);
        assert_eq!(config.control.combo_limit, 24);
        assert!(!config.debug.save_frames);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unknown_method_rejected() {
        let broken = SAMPLE.replace("method: region", "method: magic");
        assert!(serde_yaml::from_str::<Config>(&broken).is_err());
    }
}
