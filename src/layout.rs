//! Last window geometry, persisted as a small JSON file.
//!
//! Front ends read it on startup and write it on exit. Loading is best
//! effort: a missing or corrupt file simply means "use the default size".

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default file name, relative to the working directory.
pub const GEOMETRY_FILE: &str = "gui_geometry.json";

/// Window position and size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width
    pub w: u32,
    /// Height
    pub h: u32,
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self {
            x: 100,
            y: 100,
            w: 500,
            h: 700,
        }
    }
}

impl WindowGeometry {
    /// Read the saved geometry; `None` on any failure.
    pub fn load(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| debug!(path = %path.display(), "No saved geometry: {}", e))
            .ok()?;
        serde_json::from_str(&text)
            .map_err(|e| debug!(path = %path.display(), "Ignoring unreadable geometry: {}", e))
            .ok()
    }

    /// Saved geometry, or the default size.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the geometry to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let json = serde_json::to_string(self).map_err(std::io::Error::from)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GEOMETRY_FILE);
        let geometry = WindowGeometry {
            x: 10,
            y: 20,
            w: 800,
            h: 600,
        };

        geometry.save(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"x":10,"y":20,"w":800,"h":600}"#
        );
        assert_eq!(WindowGeometry::load(&path), Some(geometry));
    }

    #[test]
    fn test_bad_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GEOMETRY_FILE);
        assert_eq!(WindowGeometry::load(&path), None);

        std::fs::write(&path, "{\"x\": 1").unwrap();
        assert_eq!(WindowGeometry::load_or_default(&path), WindowGeometry::default());
    }
}
