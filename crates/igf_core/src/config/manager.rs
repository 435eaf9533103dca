//! Settings file on disk.
//!
//! Every write goes through a temp file and a rename. `set_value` only
//! rewrites the keys of the table it touches, through `toml_edit`, so notes
//! a user wrote into the file stay where they were.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml_edit::{DocumentMut, Item};

use super::settings::{ConfigSection, Settings};

/// Settings file failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot access settings file: {0}")]
    Io(#[from] io::Error),

    #[error("Settings file does not parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Settings do not serialize: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Settings file is not editable TOML: {0}")]
    Edit(#[from] toml_edit::TomlError),

    #[error("No settings file at {0}")]
    Missing(PathBuf),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// [`Settings`] bound to one TOML file.
pub struct ConfigManager {
    path: PathBuf,
    settings: Settings,
}

impl ConfigManager {
    /// Nothing is read until `load` or `load_or_create`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            settings: Settings::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Read and validate an existing file.
    pub fn load(&mut self) -> ConfigResult<()> {
        let (settings, _) = self.read()?;
        self.settings = settings;
        Ok(())
    }

    /// Like `load`, but a missing file is written with defaults and a file
    /// with missing or unknown keys is rewritten in full.
    pub fn load_or_create(&mut self) -> ConfigResult<()> {
        let incomplete = match self.read() {
            Ok((settings, incomplete)) => {
                self.settings = settings;
                incomplete
            }
            Err(ConfigError::Missing(_)) => {
                self.settings = Settings::default();
                true
            }
            Err(e) => return Err(e),
        };

        if incomplete {
            tracing::debug!("Writing complete settings to {}", self.path.display());
            self.save()?;
        }
        Ok(())
    }

    /// Create the work and log folders named in the settings.
    pub fn create_dirs(&self) -> ConfigResult<()> {
        let paths = &self.settings.paths;
        for dir in [&paths.work_dir, &paths.logs_folder] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Parsed settings, plus whether the file lacks keys or has extra tables.
    fn read(&self) -> ConfigResult<(Settings, bool)> {
        if !self.path.is_file() {
            return Err(ConfigError::Missing(self.path.clone()));
        }
        let content = fs::read_to_string(&self.path)?;

        // serde fills every missing key with its default
        let settings: Settings = toml::from_str(&content)?;
        settings.validate().map_err(ConfigError::Invalid)?;

        let on_disk: DocumentMut = content.parse()?;
        let complete = Self::render(&settings)?;
        let unknown = on_disk
            .iter()
            .any(|(table, _)| Self::section(table).is_none());
        let missing = complete.iter().any(|(table, item)| {
            match (on_disk.get(table).and_then(Item::as_table), item.as_table()) {
                (Some(have), Some(want)) => want.iter().any(|(k, _)| !have.contains_key(k)),
                _ => true,
            }
        });

        Ok((settings, unknown || missing))
    }

    fn section(table: &str) -> Option<ConfigSection> {
        ConfigSection::ALL
            .iter()
            .copied()
            .find(|s| s.table_name() == table)
    }

    /// The whole settings tree as an editable document.
    fn render(settings: &Settings) -> ConfigResult<DocumentMut> {
        Ok(toml::to_string_pretty(settings)?.parse()?)
    }

    /// Write every section, each under its comment.
    pub fn save(&self) -> ConfigResult<()> {
        let mut doc = Self::render(&self.settings)?;

        for (i, section) in ConfigSection::ALL.iter().enumerate() {
            let Some(table) = doc
                .get_mut(section.table_name())
                .and_then(Item::as_table_mut)
            else {
                continue;
            };
            let header = if i == 0 {
                "# igf settings. `igf config set` keeps your comments.\n\n"
            } else {
                "\n"
            };
            table
                .decor_mut()
                .set_prefix(format!("{}{}\n", header, section.comment()));
        }

        self.replace_file(&doc.to_string())
    }

    /// Set `section.field` from command-line text and write that section.
    ///
    /// String fields take the text as is; other fields parse it as a TOML
    /// value. The result must still validate.
    pub fn set_value(&mut self, key: &str, raw: &str) -> ConfigResult<ConfigSection> {
        let (table, field) = key
            .split_once('.')
            .ok_or_else(|| ConfigError::Invalid(format!("'{}' is not section.field", key)))?;
        let section = Self::section(table)
            .ok_or_else(|| ConfigError::Invalid(format!("Unknown section '{}'", table)))?;

        let mut root = toml::Value::try_from(&self.settings)?;
        let slot = root
            .get_mut(table)
            .and_then(|t| t.get_mut(field))
            .ok_or_else(|| ConfigError::Invalid(format!("Unknown setting '{}'", key)))?;

        let bad_value = || ConfigError::Invalid(format!("Bad value '{}' for {}", raw, key));
        *slot = if slot.is_str() {
            toml::Value::String(raw.to_string())
        } else {
            let mut parsed: toml::Table =
                toml::from_str(&format!("v = {}", raw)).map_err(|_| bad_value())?;
            parsed.remove("v").ok_or_else(bad_value)?
        };

        let settings: Settings = root
            .try_into()
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))?;
        settings.validate().map_err(ConfigError::Invalid)?;

        self.settings = settings;
        self.write_section(section)?;
        Ok(section)
    }

    /// Overwrite the keys of one table with the in-memory values. Everything
    /// else in the file, comments included, is written back as it was.
    fn write_section(&self, section: ConfigSection) -> ConfigResult<()> {
        let name = section.table_name();
        let mut doc: DocumentMut = match fs::read_to_string(&self.path) {
            Ok(content) => content.parse()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => DocumentMut::new(),
            Err(e) => return Err(e.into()),
        };

        let rendered = Self::render(&self.settings)?;
        let Some(fresh) = rendered.get(name).and_then(Item::as_table) else {
            return Ok(());
        };
        match doc.get_mut(name).and_then(Item::as_table_mut) {
            Some(table) => {
                for (key, item) in fresh.iter() {
                    table.insert(key, item.clone());
                }
            }
            None => doc[name] = Item::Table(fresh.clone()),
        }

        self.replace_file(&doc.to_string())
    }

    fn replace_file(&self, content: &str) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("toml.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh(dir: &Path) -> (ConfigManager, PathBuf) {
        let path = dir.join("igf.toml");
        let mut manager = ConfigManager::new(&path);
        manager.load_or_create().unwrap();
        (manager, path)
    }

    #[test]
    fn first_load_writes_commented_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".config").join("igf.toml");

        ConfigManager::new(&path).load_or_create().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# igf settings."));
        assert!(content.contains("[timing]"));
        assert!(content.contains("# Crop and output size\n[size]"));
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn partial_file_is_completed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("igf.toml");
        fs::write(&path, "[timing]\nframe_rate = 24\n").unwrap();

        let mut manager = ConfigManager::new(&path);
        manager.load_or_create().unwrap();

        assert_eq!(manager.settings().timing.frame_rate, 24);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[effects]"));
        assert!(content.contains("frame_rate = 24"));
        assert!(content.contains("duration_sec = 5.0"));
    }

    #[test]
    fn complete_file_is_left_alone() {
        let dir = tempdir().unwrap();
        let (_, path) = fresh(dir.path());
        let content = fs::read_to_string(&path).unwrap();
        let edited = content.replace("[timing]", "# mine\n[timing]");
        fs::write(&path, &edited).unwrap();

        ConfigManager::new(&path).load_or_create().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), edited);
    }

    #[test]
    fn invalid_or_missing_files_are_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("igf.toml");

        let err = ConfigManager::new(&path).load().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        fs::write(&path, "[timing]\nframe_rate = 0\n").unwrap();
        let err = ConfigManager::new(&path).load().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn set_value_rewrites_one_section() {
        let dir = tempdir().unwrap();
        let (mut manager, path) = fresh(dir.path());
        let content = fs::read_to_string(&path).unwrap();
        fs::write(
            &path,
            content.replace("[effects]", "# my grading notes\n[effects]"),
        )
        .unwrap();

        let section = manager.set_value("timing.frame_rate", "24").unwrap();
        assert_eq!(section, ConfigSection::Timing);
        manager.set_value("timing.start_time", "random").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("frame_rate = 24"));
        assert!(content.contains("start_time = \"random\""));
        assert!(content.contains("# my grading notes"));
        assert!(content.contains("# Which part of the source becomes frames"));

        let mut reloaded = ConfigManager::new(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.settings().timing.frame_rate, 24);
        assert!(reloaded.settings().timing.is_random_start());
    }

    #[test]
    fn set_value_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let (mut manager, path) = fresh(dir.path());
        let before = fs::read_to_string(&path).unwrap();

        for (key, value) in [
            ("frame_rate", "24"),
            ("timing.nope", "1"),
            ("colors.depth", "1"),
            ("timing.frame_rate", "fast"),
            ("timing.frame_rate", "0"),
        ] {
            let err = manager.set_value(key, value).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{} = {}", key, value);
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert_eq!(manager.settings().timing.frame_rate, 10);
    }

    #[test]
    fn create_dirs_makes_work_and_log_folders() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("igf.toml");
        fs::write(
            &path,
            format!(
                "[paths]\nwork_dir = {:?}\nlogs_folder = {:?}\n",
                dir.path().join("w").display().to_string(),
                dir.path().join("l").display().to_string()
            ),
        )
        .unwrap();

        let mut manager = ConfigManager::new(&path);
        manager.load_or_create().unwrap();
        manager.create_dirs().unwrap();
        assert!(dir.path().join("w").is_dir());
        assert!(dir.path().join("l").is_dir());
    }
}
