// Config Module - Configuration management and command-line argument parsing
use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

// Global storage for custom config path
static CUSTOM_CONFIG_PATH: OnceLock<Option<String>> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Animated 3D point cloud that morphs between named shapes",
    long_about = "Runs a particle choreography engine: a point cloud that morphs between\n\
                  shapes (tree, heart, scatter, saturn, flower, dna, sphere) driven by\n\
                  keyboard, HTTP API, or browser-side hand gestures. Frames stream to the\n\
                  built-in web viewer over a websocket."
)]
pub struct Args {
    /// Initial shape mode
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Main cloud particle count
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Target framerate (frames per second)
    #[arg(long)]
    pub fps: Option<f64>,

    /// HTTP server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Tree rendering style (glyph or cone)
    #[arg(long)]
    pub tree_style: Option<String>,

    /// Text rasterized for the glyph tree (digits and spaces)
    #[arg(long)]
    pub glyph_text: Option<String>,

    /// Quiet mode (no TUI status pane)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Config file path or name (e.g., --cfg /full/path or --cfg myconf for ~/.config/morphcloud/myconf.conf)
    #[arg(long)]
    pub cfg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,  // Stores the config file path (not serialized)

    pub mode: String,  // Initial shape mode: tree, heart, scatter, saturn, flower, dna, sphere
    pub main_count: usize,
    pub ribbon_count: usize,
    pub ambient_count: usize,
    pub main_damping: f32,
    pub ribbon_damping: f32,
    pub ambient_damping: f32,
    pub fps: f64,
    pub tree_style: String,  // "glyph" or "cone"
    pub glyph_text: String,  // Digits and spaces rasterized for the glyph tree
    pub heart_outline: bool,  // Sample the heart boundary only instead of the filled area
    pub gesture_enabled: bool,
    pub gesture_min_interval_ms: u64,
    pub gesture_single_confidence: f32,
    pub gesture_combo_confidence: f32,
    pub httpd_enabled: bool,
    pub httpd_ip: String,
    pub httpd_port: u16,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            config_path: None,
            mode: "tree".to_string(),
            main_count: 3000,
            ribbon_count: 1200,
            ambient_count: 1000,
            main_damping: 2.0,
            ribbon_damping: 3.0,
            ambient_damping: 1.5,
            fps: 60.0,
            tree_style: "glyph".to_string(),
            glyph_text: "20 26".to_string(),
            heart_outline: false,
            gesture_enabled: true,
            gesture_min_interval_ms: 200,
            gesture_single_confidence: 0.55,
            gesture_combo_confidence: 0.8,
            httpd_enabled: true,
            httpd_ip: "localhost".to_string(),
            httpd_port: 8080,
        }
    }
}

impl CloudConfig {
    pub fn merge_with_args(&mut self, args: &Args) -> bool {
        // Track if any args were actually provided
        let mut args_provided = false;

        if let Some(ref mode) = args.mode {
            self.mode = mode.clone();
            args_provided = true;
        }

        if let Some(count) = args.count {
            self.main_count = count;
            args_provided = true;
        }

        if let Some(fps) = args.fps {
            self.fps = fps;
            args_provided = true;
        }

        if let Some(port) = args.port {
            self.httpd_port = port;
            args_provided = true;
        }

        if let Some(ref tree_style) = args.tree_style {
            self.tree_style = tree_style.clone();
            args_provided = true;
        }

        if let Some(ref glyph_text) = args.glyph_text {
            self.glyph_text = glyph_text.clone();
            args_provided = true;
        }

        args_provided
    }

    /// Set the global config path (called once at startup)
    pub fn set_config_path(cfg: Option<String>) {
        let _ = CUSTOM_CONFIG_PATH.set(cfg);
    }

    /// Get the global config path (if set)
    fn get_config_path_arg() -> Option<&'static str> {
        CUSTOM_CONFIG_PATH.get()
            .and_then(|opt| opt.as_deref())
    }

    pub fn config_path(cfg_arg: Option<&str>) -> Result<PathBuf> {
        // Priority: explicit arg > global > None
        let cfg = cfg_arg.or_else(|| Self::get_config_path_arg());

        if let Some(cfg) = cfg {
            // Check if it's an absolute path
            let path = PathBuf::from(cfg);
            if path.is_absolute() {
                return Ok(path);
            }

            // Check if it contains path separators (relative path)
            if cfg.contains('/') || cfg.contains('\\') {
                return Ok(path);
            }

            // Otherwise treat as config name in config directory
            let home = std::env::var("HOME")?;
            let config_dir = PathBuf::from(home).join(".config").join("morphcloud");
            std::fs::create_dir_all(&config_dir)?;

            // Add .conf extension if not present
            let filename = if cfg.ends_with(".conf") {
                cfg.to_string()
            } else {
                format!("{}.conf", cfg)
            };

            Ok(config_dir.join(filename))
        } else {
            // Default config path
            let home = std::env::var("HOME")?;
            let config_dir = PathBuf::from(home).join(".config").join("morphcloud");
            std::fs::create_dir_all(&config_dir)?;
            Ok(config_dir.join("config.conf"))
        }
    }

    pub fn load_with_path(cfg_arg: Option<&str>) -> Result<Self> {
        let path = Self::config_path(cfg_arg)?;
        let contents = std::fs::read_to_string(&path)?;
        let mut parsed: Self = toml::from_str(&contents)?;
        parsed.config_path = Some(path);
        parsed.sanitize();
        Ok(parsed)
    }

    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Sanitize config values to handle common formatting issues
    pub fn sanitize(&mut self) {
        self.mode = self.mode.trim().to_lowercase();
        self.tree_style = self.tree_style.trim().to_lowercase();
        self.httpd_ip = self.httpd_ip.trim().to_string();

        // Glyph text keeps spaces (they split lines) but only digits otherwise
        self.glyph_text = self
            .glyph_text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == ' ')
            .collect::<String>()
            .trim()
            .to_string();
        if self.glyph_text.is_empty() {
            self.glyph_text = "20 26".to_string();
        }

        // Clamp numeric values to reasonable ranges
        self.main_count = self.main_count.max(1).min(200_000);
        self.ribbon_count = self.ribbon_count.max(1).min(100_000);
        self.ambient_count = self.ambient_count.max(1).min(100_000);
        self.main_damping = self.main_damping.max(0.1).min(60.0);
        self.ribbon_damping = self.ribbon_damping.max(0.1).min(60.0);
        self.ambient_damping = self.ambient_damping.max(0.1).min(60.0);
        self.fps = self.fps.max(1.0).min(500.0);
        self.gesture_min_interval_ms = self.gesture_min_interval_ms.max(10).min(10_000);
        self.gesture_single_confidence = self.gesture_single_confidence.max(0.0).min(1.0);
        self.gesture_combo_confidence = self.gesture_combo_confidence.max(0.0).min(1.0);
        self.httpd_port = self.httpd_port.max(1);
    }

    pub fn save(&self) -> Result<()> {
        let path = match self.config_path.clone() {
            Some(p) => p,
            None => Self::config_path(None)?,
        };

        // Sanitize values before saving
        let mut sanitized = self.clone();
        sanitized.sanitize();

        // Build TOML with comments manually for better documentation
        let contents = format!(
            r#"# morphcloud Configuration File
# Edit this file while the program is running to change settings in real-time

# Initial shape mode
# Options: "tree", "heart", "scatter", "saturn", "flower", "dna", "sphere"
mode = "{}"

# Particle count of the main morphing cloud
main_count = {}

# Particle count of the ribbon group (double ring / helix)
ribbon_count = {}

# Particle count of the ambient snowfall group
ambient_count = {}

# Convergence rate of the main cloud (higher = snappier morphs)
main_damping = {}

# Convergence rate of the ribbon group
ribbon_damping = {}

# Convergence rate of the ambient group
ambient_damping = {}

# Rendering frame rate (can be changed while running)
fps = {}

# Tree rendering style
# Options: "glyph" (rasterized digits), "cone" (classic conifer)
tree_style = "{}"

# Text rasterized for the glyph tree (digits and spaces, space = line break)
glyph_text = "{}"

# Sample only the heart outline instead of the filled area
# Options: true, false
heart_outline = {}

# Enable the gesture adapter at startup
# Options: true, false
gesture_enabled = {}

# Minimum milliseconds between gesture classifications
gesture_min_interval_ms = {}

# Confidence threshold for single-hand gestures (0.0 - 1.0)
gesture_single_confidence = {}

# Confidence threshold for the two-hand combo gesture (0.0 - 1.0)
gesture_combo_confidence = {}

# HTTP server configuration
# Enable or disable the built-in web viewer and API
httpd_enabled = {}

# IP address for the HTTP server to listen on
# Use "0.0.0.0" to listen on all interfaces, or "127.0.0.1" for localhost only
httpd_ip = "{}"

# Port for the HTTP server to listen on
httpd_port = {}
"#,
            sanitized.mode,
            sanitized.main_count,
            sanitized.ribbon_count,
            sanitized.ambient_count,
            sanitized.main_damping,
            sanitized.ribbon_damping,
            sanitized.ambient_damping,
            sanitized.fps,
            sanitized.tree_style,
            sanitized.glyph_text,
            sanitized.heart_outline,
            sanitized.gesture_enabled,
            sanitized.gesture_min_interval_ms,
            sanitized.gesture_single_confidence,
            sanitized.gesture_combo_confidence,
            sanitized.httpd_enabled,
            sanitized.httpd_ip,
            sanitized.httpd_port,
        );

        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let config = CloudConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: CloudConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.mode, "tree");
        assert_eq!(parsed.main_count, 3000);
        assert_eq!(parsed.glyph_text, "20 26");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: CloudConfig = toml::from_str("mode = \"heart\"\nfps = 30.0\n").unwrap();
        assert_eq!(parsed.mode, "heart");
        assert_eq!(parsed.fps, 30.0);
        assert_eq!(parsed.ribbon_count, 1200);
    }

    #[test]
    fn test_sanitize_clamps_and_cleans() {
        let mut config = CloudConfig::default();
        config.mode = "  HEART ".to_string();
        config.main_count = 0;
        config.fps = 10_000.0;
        config.glyph_text = "ab12 c34".to_string();
        config.gesture_single_confidence = 1.7;
        config.sanitize();

        assert_eq!(config.mode, "heart");
        assert_eq!(config.main_count, 1);
        assert_eq!(config.fps, 500.0);
        assert_eq!(config.glyph_text, "12 34");
        assert_eq!(config.gesture_single_confidence, 1.0);
    }

    #[test]
    fn test_merge_with_args_overrides_only_given() {
        let mut config = CloudConfig::default();
        let args = Args {
            mode: Some("saturn".to_string()),
            count: None,
            fps: Some(30.0),
            port: None,
            tree_style: None,
            glyph_text: None,
            quiet: false,
            cfg: None,
        };
        assert!(config.merge_with_args(&args));
        assert_eq!(config.mode, "saturn");
        assert_eq!(config.fps, 30.0);
        assert_eq!(config.main_count, 3000, "untouched field keeps config value");
    }
}
