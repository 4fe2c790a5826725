//! catalog — accessory assets and the live "current hat" selection
//!
//! Every image in the hats directory becomes an [`AccessoryAsset`]. A sibling
//! `<stem>.json` file may tune its placement:
//!
//! ```json
//! { "scale_factor": 1.6, "y_offset_factor": 0.7, "x_offset_factor": 0.05 }
//! ```
//!
//! Missing keys fall back to [`AccessorySettings::default`].

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, ensure};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Image extensions picked up by [`HatCatalog::load`] (matched case-insensitively).
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

// ── Asset ────────────────────────────────────────────────────────────────────

/// Placement of an accessory relative to the face box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessorySettings {
    /// Accessory width as a multiple of the face width.
    pub scale_factor: f32,
    /// How far the accessory is lifted above the face top, as a fraction of
    /// its own height.
    pub y_offset_factor: f32,
    /// Horizontal shift as a fraction of the accessory width.
    pub x_offset_factor: f32,
}

impl Default for AccessorySettings {
    fn default() -> Self {
        Self {
            scale_factor: 1.4,
            y_offset_factor: 0.8,
            x_offset_factor: 0.0,
        }
    }
}

impl AccessorySettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.scale_factor.is_finite() && self.scale_factor > 0.0,
            "scale_factor must be a positive number, got {}",
            self.scale_factor
        );
        ensure!(
            self.y_offset_factor.is_finite() && self.x_offset_factor.is_finite(),
            "offset factors must be finite"
        );
        Ok(())
    }

    /// Read a metadata file, validating the values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("malformed accessory metadata {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("invalid accessory metadata {}", path.display()))?;
        Ok(settings)
    }
}

/// An RGBA accessory image plus its placement settings.
#[derive(Debug, Clone)]
pub struct AccessoryAsset {
    name: String,
    image: RgbaImage,
    settings: AccessorySettings,
}

impl AccessoryAsset {
    pub fn new(name: impl Into<String>, image: RgbaImage, settings: AccessorySettings) -> Self {
        Self {
            name: name.into(),
            image,
            settings,
        }
    }

    /// Load an image and its optional `<stem>.json` metadata. Images without
    /// an alpha channel become fully opaque.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = display_name(path)
            .with_context(|| format!("cannot derive a name from {}", path.display()))?;
        let image = image::open(path)
            .with_context(|| format!("could not load accessory image {}", path.display()))?
            .into_rgba8();
        ensure!(
            image.width() > 0 && image.height() > 0,
            "accessory image {} is empty",
            path.display()
        );

        let meta_path = path.with_extension("json");
        let settings = if meta_path.is_file() {
            AccessorySettings::load(&meta_path)?
        } else {
            debug!(path = %meta_path.display(), "no accessory metadata, using defaults");
            AccessorySettings::default()
        };

        Ok(Self::new(name, image, settings))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn settings(&self) -> &AccessorySettings {
        &self.settings
    }
}

/// `top_hat.png` → `TOP HAT`.
pub fn display_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    Some(stem.to_uppercase().replace(['-', '_'], " "))
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// Current index and on/off flag, always read and written together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub index: usize,
    pub enabled: bool,
}

/// Immutable list of assets plus a mutex-guarded [`Selection`].
#[derive(Debug, Default)]
pub struct HatCatalog {
    assets: Vec<Arc<AccessoryAsset>>,
    selection: Mutex<Selection>,
}

impl HatCatalog {
    /// Starts on the first asset with the overlay disabled.
    pub fn new(assets: Vec<AccessoryAsset>) -> Self {
        Self {
            assets: assets.into_iter().map(Arc::new).collect(),
            selection: Mutex::new(Selection::default()),
        }
    }

    /// Load every supported image under `dir`, sorted by path. Unloadable
    /// assets are logged and skipped; a missing directory gives an empty
    /// catalog.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        info!(dir = %dir.display(), "loading accessories");
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "accessory directory not found");
            return Ok(Self::default());
        }

        let mut paths = BTreeSet::new();
        collect_images(dir, &mut paths)?;

        let mut assets = Vec::with_capacity(paths.len());
        for path in paths {
            match AccessoryAsset::load(&path) {
                Ok(asset) => {
                    info!(name = asset.name(), settings = ?asset.settings(), "loaded accessory");
                    assets.push(asset);
                }
                Err(e) => warn!("skipping accessory: {e:#}"),
            }
        }

        if assets.is_empty() {
            warn!(dir = %dir.display(), "no accessories found");
        } else {
            info!(count = assets.len(), "accessories loaded");
        }
        Ok(Self::new(assets))
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.assets.iter().map(|a| a.name())
    }

    fn lock(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent copy of index + flag.
    pub fn selection(&self) -> Selection {
        *self.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// The selected asset, regardless of the enabled flag.
    pub fn current(&self) -> Option<Arc<AccessoryAsset>> {
        let index = self.lock().index;
        self.assets.get(index).cloned()
    }

    /// The selected asset if the overlay is enabled.
    pub fn active(&self) -> Option<Arc<AccessoryAsset>> {
        let selection = self.selection();
        if !selection.enabled {
            return None;
        }
        self.assets.get(selection.index).cloned()
    }

    /// Select the asset whose display name equals `name` exactly and enable
    /// the overlay. Unknown names leave the state untouched.
    pub fn select_by_name(&self, name: &str) -> bool {
        let Some(index) = self.assets.iter().position(|a| a.name() == name) else {
            return false;
        };
        *self.lock() = Selection {
            index,
            enabled: true,
        };
        true
    }

    /// Turn the overlay off, keeping the selection.
    pub fn disable(&self) {
        self.lock().enabled = false;
    }
}

fn collect_images(dir: &Path, out: &mut BTreeSet<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("cannot read directory {}", dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("cannot read entry in {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if has_supported_extension(&path) {
            // symlinked duplicates collapse to one entry
            out.insert(fs::canonicalize(&path).unwrap_or(path));
        }
    }
    Ok(())
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}
