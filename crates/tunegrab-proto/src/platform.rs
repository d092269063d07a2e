use std::path::PathBuf;

const APP_DIR: &str = "tunegrab";

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/tunegrab/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        // On Windows, check for portable data directory in executable directory first
        if let Some(portable) = beside_exe("data") {
            return portable;
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    // On Windows, check for portable config.toml in executable directory first
    #[cfg(windows)]
    {
        if let Some(portable) = beside_exe("config.toml") {
            if let Some(dir) = portable.parent() {
                return dir.to_path_buf();
            }
        }
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn log_path() -> PathBuf {
    data_dir().join("daemon.log")
}

#[cfg(windows)]
fn beside_exe(name: &str) -> Option<PathBuf> {
    let exe_path = std::env::current_exe().ok()?;
    let candidate = exe_path.parent()?.join(name);
    candidate.exists().then_some(candidate)
}
