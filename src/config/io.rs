use std::env::{current_exe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::{ProjectDirs};
use tokio::fs::{File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::OpenOptions;
use std::str;
use log::{info, warn};

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to CONFIG_FILE_NAME in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // F:\colorlink.exe => F:\colorlink.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to colorlink.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "colorlink", "colorlink").map(|dirs| {
        dirs.config_dir().join("colorlink.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    let portable = get_portable_config_path();
    if let Some(path) = portable {
        let attr = std::fs::metadata(&path);
        match attr {
            Ok(attr) => {
                if attr.is_file() {
                    return Ok(path);
                }
            }
            Err(err) => {
                info!("Could not read metadata of: {}; Using local path instead. ({:?})", path.to_string_lossy(), err);
            },
        }

    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) =>{
                return Err(ConfigError::CanNotLock { source });
            },
        }
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    /// Open the config file at `path`, or at the portable/local default location.
    pub fn new_sync(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => get_config_path()?,
        };

        Self::open(&path)
    }

    fn open(path: &Path) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent().filter(|directory| !directory.as_os_str().is_empty()) {
            std::fs::create_dir_all(directory)?;
        }

        // the caller obtains an exclusive file lock through locker() so that only one instance
        // of this application talks to the radio.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let inner = ConfigIOInner {
            file,
        };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn locker(&mut self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        let file = inner.file.try_clone()?; // std File
        Ok(File::from_std(file)) // tokio File
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        info!("Reading config file");

        // the handle shares its cursor with earlier saves
        file.rewind().await?;
        let mut content = vec![];
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            // first run: leave a file with every setting for the user to edit
            let config = Config::default();
            self.save(config.clone()).await?;
            return Ok(config);
        }

        let content = str::from_utf8(&content)?;

        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub async fn save(&self, config: Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config");

        let content = serde_json::to_string_pretty(&config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::TransportKind;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("colorlink-test-{}", uuid::Uuid::new_v4()))
            .join("colorlink.json")
    }

    #[tokio::test]
    async fn empty_file_is_filled_with_defaults() {
        let path = temp_config_path();
        let config_io = ConfigIO::new_sync(Some(path.clone())).unwrap();

        assert_eq!(config_io.read().await.unwrap(), Config::default());

        let written: Config = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, Config::default());
    }

    #[tokio::test]
    async fn saved_config_is_read_back() {
        let config_io = ConfigIO::new_sync(Some(temp_config_path())).unwrap();
        let config = Config { transport: TransportKind::Simulated, scan_timeout_ms: 2500, ..Config::default() };

        config_io.save(config.clone()).await.unwrap();
        config_io.save(config.clone()).await.unwrap();

        assert_eq!(config_io.read().await.unwrap(), config);
    }

    #[test]
    fn second_instance_can_not_lock() {
        let path = temp_config_path();
        let mut first = ConfigIO::new_sync(Some(path.clone())).unwrap();
        let mut second = ConfigIO::new_sync(Some(path)).unwrap();

        let mut first_locker = first.locker().unwrap();
        let _guard = first_locker.lock().unwrap();

        let mut second_locker = second.locker().unwrap();
        assert!(matches!(second_locker.lock(), Err(ConfigError::CanNotLock { .. })));
    }
}
