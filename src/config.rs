//! Harness configuration
//!
//! Settings come from a TOML file (`workshop.toml` in the working directory
//! unless `--config` names another one). Every field has a default, so a
//! partial file only overrides what it mentions.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::camera::OrbitCamera;
use crate::frame::{FrameParams, FrameSettings};

/// Config file picked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "workshop.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config '{0}': {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config '{0}': {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

/// All harness settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub window: WindowConfig,
    pub assets: AssetConfig,
    pub scene: SceneConfig,
}

impl HarnessConfig {
    /// Loads settings from `path`, or from [`DEFAULT_CONFIG_FILE`] when no
    /// path is given.
    ///
    /// An explicit path must exist. The default file is optional; without
    /// it the built-in defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_optional_file(Path::new(DEFAULT_CONFIG_FILE)),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    fn from_optional_file(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            info!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Startup inputs of the frame loop.
    pub fn frame_settings(&self) -> FrameSettings {
        let scene = &self.scene;
        FrameSettings {
            camera: OrbitCamera::new()
                .radius(scene.orbit_radius)
                .height(scene.orbit_height)
                .speed(scene.orbit_speed),
            aspect: self.window.aspect(),
            near: scene.near,
            far: scene.far,
            clear_color: scene.clear_color,
        }
    }

    /// Initial values of the overlay-adjustable parameters.
    pub fn frame_params(&self) -> FrameParams {
        FrameParams {
            fov_degrees: self.scene.fov_degrees,
            effect_strength: self.scene.effect_strength,
        }
    }
}

/// Window settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "workshop".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
        }
    }
}

impl WindowConfig {
    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Asset paths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// glTF scene (`.gltf` or `.glb`)
    pub mesh: PathBuf,
    pub texture: PathBuf,
    /// Precompiled SPIR-V vertex stage
    pub vertex_shader: PathBuf,
    /// Precompiled SPIR-V fragment stage
    pub fragment_shader: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            mesh: PathBuf::from("assets/mesh.glb"),
            texture: PathBuf::from("assets/texture.png"),
            vertex_shader: PathBuf::from("shaders/mesh.vert.spv"),
            fragment_shader: PathBuf::from("shaders/mesh.frag.spv"),
        }
    }
}

/// Scene, camera and instance grid settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Instances per grid side
    pub grid_size: u32,
    pub grid_spacing: f32,
    pub orbit_radius: f32,
    pub orbit_height: f32,
    /// Radians per second
    pub orbit_speed: f32,
    pub fov_degrees: f32,
    pub effect_strength: f32,
    pub near: f32,
    pub far: f32,
    pub clear_color: [f32; 4],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            grid_size: 4,
            grid_spacing: 2.5,
            orbit_radius: 12.0,
            orbit_height: 4.0,
            orbit_speed: 0.4,
            fov_degrees: 60.0,
            effect_strength: 0.5,
            near: 0.1,
            far: 200.0,
            clear_color: [0.08, 0.08, 0.1, 1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file = config_file(
            r#"
            [window]
            width = 800
            height = 800

            [scene]
            grid_size = 2
            "#,
        );

        let config = HarnessConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.title, "workshop");
        assert_eq!(config.scene.grid_size, 2);
        assert_eq!(config.scene.fov_degrees, 60.0);
        assert_eq!(config.assets, AssetConfig::default());
        assert_eq!(config.frame_settings().aspect, 1.0);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = HarnessConfig::load(Some(Path::new("/nonexistent/workshop.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn missing_default_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::from_optional_file(&dir.path().join("workshop.toml")).unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = config_file("[scene]\ngrid_size = \"many\"\n");
        let err = HarnessConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = HarnessConfig::default();
        config.assets.mesh = PathBuf::from("scenes/teapot.gltf");
        config.scene.clear_color = [1.0, 0.0, 0.0, 1.0];

        let text = toml::to_string_pretty(&config).unwrap();
        let file = config_file(&text);

        assert_eq!(HarnessConfig::load(Some(file.path())).unwrap(), config);
    }

    #[test]
    fn frame_inputs_come_from_scene_section() {
        let config = HarnessConfig::default();
        let settings = config.frame_settings();
        assert_eq!(settings.camera.radius, 12.0);
        assert_eq!(settings.aspect, 1280.0 / 720.0);
        assert_eq!(config.frame_params().fov_degrees, 60.0);

        let flat = WindowConfig {
            height: 0,
            ..WindowConfig::default()
        };
        assert_eq!(flat.aspect(), 1.0);
    }
}
