use super::ConfigError;
use std::{collections::HashMap, fs, path::Path};

/// Key/value options of a `.data` file.
#[derive(Debug, Clone)]
pub struct DataConfig {
    options: HashMap<String, String>,
    source: std::path::PathBuf,
}

impl DataConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingDataKey {
            path: self.source.clone(),
            key: key.to_string(),
        })
    }

    pub fn train_list(&self) -> Result<&str, ConfigError> {
        self.require("train")
    }

    pub fn valid_list(&self) -> Result<&str, ConfigError> {
        self.require("valid")
    }

    pub fn names_file(&self) -> Result<&str, ConfigError> {
        self.require("names")
    }
}

pub fn parse_data_config(path: impl AsRef<Path>) -> Result<DataConfig, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut options = HashMap::from([
        ("gpus".to_string(), "0,1,2,3".to_string()),
        ("num_workers".to_string(), "10".to_string()),
    ]);
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("expected `key=value`, got `{line}`"),
            });
        };
        options.insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(DataConfig {
        options,
        source: path.to_path_buf(),
    })
}

/// Reads one class name per line.
pub fn load_classes(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_comments_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coco.data");
        fs::write(
            &path,
            "# comment\nclasses= 80\ntrain  = data/train.txt\n\nvalid=data/val.txt\nnames = data/coco.names\n",
        )
        .unwrap();

        let cfg = parse_data_config(&path).unwrap();
        assert_eq!(cfg.train_list().unwrap(), "data/train.txt");
        assert_eq!(cfg.valid_list().unwrap(), "data/val.txt");
        assert_eq!(cfg.names_file().unwrap(), "data/coco.names");
        assert_eq!(cfg.get("classes"), Some("80"));
        assert_eq!(cfg.get("num_workers"), Some("10"));
    }

    #[test]
    fn missing_key_and_bad_line_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.data");
        fs::write(&path, "train=a.txt\n").unwrap();
        let cfg = parse_data_config(&path).unwrap();
        assert!(matches!(
            cfg.valid_list(),
            Err(ConfigError::MissingDataKey { .. })
        ));

        fs::write(&path, "train a.txt\n").unwrap();
        assert!(matches!(
            parse_data_config(&path),
            Err(ConfigError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn class_names_skip_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names");
        fs::write(&path, "person\n\nbicycle\ncar\n").unwrap();
        assert_eq!(load_classes(&path).unwrap(), ["person", "bicycle", "car"]);
    }
}
