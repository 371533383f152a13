//! Utility functions for directory management
//!
//! Helper functions following the XDG Base Directory specification for
//! portable configuration storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Data: `~/.local/share/podwall/` - Configuration and inventory files

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "podwall", "podwall").map(|pd| pd.data_dir().to_path_buf())
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_data_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_data_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}
