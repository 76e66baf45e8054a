//! Runtime configuration parameters
//!
//! Validation happens entirely before anything is adopted, so a rejected
//! update leaves the previous configuration in force.

use std::ffi::CString;
use std::fmt;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Used when neither the configuration nor the command line names a
/// directory for the mapped segment files.
pub const DEFAULT_MAPPED_FILE_DIR: &str = "mapped_files";

#[derive(Debug)]
pub enum ConfigError {
    NotADirectory(PathBuf),
    NotWritable(PathBuf),
    BadValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NotADirectory(path) => {
                write!(f, "{} is not a directory", path.display())
            }
            ConfigError::NotWritable(path) => {
                write!(f, "{} is not writable", path.display())
            }
            ConfigError::BadValue(text) => write!(f, "bad configuration value: {}", text),
        }
    }
}

impl std::error::Error for ConfigError {}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq)]
pub struct ConfigParams {
    pub mapped_file_dir: PathBuf,
}

impl ConfigParams {
    pub fn validate(&self) -> Result<()> {
        let dir = &self.mapped_file_dir;
        match fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => (),
            _ => return Err(ConfigError::NotADirectory(dir.clone())),
        }
        if !is_writable(dir) {
            return Err(ConfigError::NotWritable(dir.clone()));
        }
        Ok(())
    }
}

fn is_writable(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::W_OK) == 0 }
}

/// Build the parameter set from a configuration update.
///
/// A key missing from the update keeps its current value, or the default
/// when there is no current configuration yet.
pub fn parse(value: &Value, current: Option<&ConfigParams>) -> Result<ConfigParams> {
    let mapped_file_dir = match value.get("mapped_file_dir") {
        Some(Value::String(dir)) => PathBuf::from(dir),
        Some(other) => {
            return Err(ConfigError::BadValue(format!(
                "mapped_file_dir must be a string, not {}",
                other
            )))
        }
        None => match current {
            Some(params) => params.mapped_file_dir.clone(),
            None => PathBuf::from(DEFAULT_MAPPED_FILE_DIR),
        },
    };
    Ok(ConfigParams { mapped_file_dir })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("strata-config-{}-{}", tag, std::process::id()));
        if dir.is_dir() {
            fs::remove_dir_all(&dir).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_parse_explicit_dir() {
        let params = parse(&json!({"mapped_file_dir": "/some/path/dir"}), None).unwrap();
        assert_eq!(PathBuf::from("/some/path/dir"), params.mapped_file_dir);
    }

    #[test]
    fn test_parse_defaults_and_carry_over() {
        let params = parse(&json!({}), None).unwrap();
        assert_eq!(PathBuf::from(DEFAULT_MAPPED_FILE_DIR), params.mapped_file_dir);

        let current = ConfigParams {
            mapped_file_dir: PathBuf::from("/kept/path"),
        };
        let params = parse(&json!({}), Some(&current)).unwrap();
        assert_eq!(PathBuf::from("/kept/path"), params.mapped_file_dir);
    }

    #[test]
    fn test_parse_rejects_non_string() {
        let err = parse(&json!({"mapped_file_dir": 42}), None).unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }

    #[test]
    fn test_validate_missing_dir() {
        let params = ConfigParams {
            mapped_file_dir: PathBuf::from("/no/such/dir/anywhere"),
        };
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_validate_good_dir() {
        let dir = scratch_dir("good");
        let params = ConfigParams {
            mapped_file_dir: dir.clone(),
        };
        assert!(params.validate().is_ok());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_validate_unwritable_dir() {
        // Everything is writable to root, so the check cannot fail there.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        use std::os::unix::fs::PermissionsExt;
        let dir = scratch_dir("ro");
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o500)).unwrap();
        let params = ConfigParams {
            mapped_file_dir: dir.clone(),
        };
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("not writable"));
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();
        fs::remove_dir_all(&dir).unwrap();
    }
}
