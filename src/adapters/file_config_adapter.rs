//! INI file configuration adapter.

use crate::domain::error::StepTraderError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StepTraderError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config
            .load(path)
            .map_err(|reason| StepTraderError::ConfigParse {
                file: path.display().to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, String> {
        let mut config = Ini::new();
        config.read(content.to_string())?;
        Ok(Self { config })
    }

    fn parse_bool(value: &str) -> Option<bool> {
        match value.to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.config
            .getint(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.config
            .getfloat(section, key)
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.config
            .get(section, key)
            .as_ref()
            .and_then(|v| Self::parse_bool(v))
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn from_string_parses_config() {
        let content = r#"
[data]
dir = ./bars
symbol = 000001

[calendar]
sessions = 09:30-11:30,13:00-15:00
source_frequency = 5m
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(adapter.get_string("data", "dir"), Some("./bars".to_string()));
        assert_eq!(
            adapter.get_string("calendar", "sessions"),
            Some("09:30-11:30,13:00-15:00".to_string())
        );
    }

    #[test]
    fn get_string_returns_none_for_missing_key() {
        let adapter = FileConfigAdapter::from_string("[account]\ncash = 100\n").unwrap();
        assert_eq!(adapter.get_string("account", "missing"), None);
        assert_eq!(adapter.get_string("missing_section", "key"), None);
    }

    #[test]
    fn get_int_returns_value_or_default() {
        let adapter =
            FileConfigAdapter::from_string("[account]\nlot_size = 100\nbad = abc\n").unwrap();
        assert_eq!(adapter.get_int("account", "lot_size", 1), 100);
        assert_eq!(adapter.get_int("account", "missing", 42), 42);
        assert_eq!(adapter.get_int("account", "bad", 42), 42);
    }

    #[test]
    fn get_double_returns_value_or_default() {
        let adapter = FileConfigAdapter::from_string(
            "[account]\ncash = 100000.5\nmargin_rate = not_a_number\n",
        )
        .unwrap();
        assert_eq!(adapter.get_double("account", "cash", 0.0), 100000.5);
        assert_eq!(adapter.get_double("account", "missing", 99.9), 99.9);
        assert_eq!(adapter.get_double("account", "margin_rate", 1.0), 1.0);
    }

    #[test]
    fn get_bool_accepts_words_and_digits() {
        let adapter = FileConfigAdapter::from_string(
            "[account]\na = true\nb = yes\nc = 1\nd = false\ne = no\nf = 0\n",
        )
        .unwrap();
        assert!(adapter.get_bool("account", "a", false));
        assert!(adapter.get_bool("account", "b", false));
        assert!(adapter.get_bool("account", "c", false));
        assert!(!adapter.get_bool("account", "d", true));
        assert!(!adapter.get_bool("account", "e", true));
        assert!(!adapter.get_bool("account", "f", true));
        assert!(adapter.get_bool("account", "missing", true));
    }

    #[test]
    fn from_file_reads_config() {
        let file = create_temp_config("[policy]\nsettlement = t1\n");
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(
            adapter.get_string("policy", "settlement"),
            Some("t1".to_string())
        );
    }

    #[test]
    fn from_file_returns_parse_error_for_missing_file() {
        let result = FileConfigAdapter::from_file("/nonexistent/path/config.ini");
        assert!(matches!(result, Err(StepTraderError::ConfigParse { .. })));
    }
}
