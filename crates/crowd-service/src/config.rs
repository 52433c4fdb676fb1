use anyhow::{bail, Context, Result};
use crowd_engine::thresholds::{DEFAULT_CROWD_THRESHOLD, DEFAULT_SURGE_LIMIT};
use crowd_engine::EngineConfig;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to bind the HTTP server to
    pub bind_addr: String,

    /// Video source to start analysing at boot (optional)
    pub source: Option<String>,

    /// JSON-lines detections replayed instead of the model (optional)
    pub detections: Option<String>,

    /// YOLOv8 ONNX model used for person detection
    pub model_path: String,

    /// Execution provider preference for the model (CPU, CUDA, TensorRT)
    pub execution_provider: String,

    /// SQLite URL for the count/alert log; in-memory log when unset
    pub database_url: Option<String>,

    pub skip_rate: u32,
    pub crowd_threshold: i64,
    pub surge_limit: i64,

    /// Size of the rendered JPEG frames
    pub output_width: u32,
    pub output_height: u32,
    pub jpeg_quality: u8,

    pub heatmap_decay: f32,

    /// Equalise frame luminance before detection
    pub equalize_contrast: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup; unset keys take defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            bind_addr: lookup("CROWD_SERVICE_ADDR").unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            source: non_empty("CROWD_SOURCE"),
            detections: non_empty("CROWD_DETECTIONS"),
            model_path: lookup("CROWD_MODEL_PATH")
                .unwrap_or_else(|| "models/yolov8n.onnx".to_string()),
            execution_provider: lookup("CROWD_EXECUTION_PROVIDER")
                .unwrap_or_else(|| "CPU".to_string()),
            database_url: non_empty("CROWD_DATABASE_URL"),
            skip_rate: parse_or(&lookup, "CROWD_SKIP_RATE", 3)?,
            crowd_threshold: parse_or(&lookup, "CROWD_THRESHOLD", DEFAULT_CROWD_THRESHOLD)?,
            surge_limit: parse_or(&lookup, "CROWD_SURGE_LIMIT", DEFAULT_SURGE_LIMIT)?,
            output_width: parse_or(&lookup, "CROWD_OUTPUT_WIDTH", 800)?,
            output_height: parse_or(&lookup, "CROWD_OUTPUT_HEIGHT", 600)?,
            jpeg_quality: parse_or(&lookup, "CROWD_JPEG_QUALITY", 80)?,
            heatmap_decay: parse_or(&lookup, "CROWD_HEATMAP_DECAY", 1.0)?,
            equalize_contrast: parse_or(&lookup, "CROWD_EQUALIZE_CONTRAST", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.crowd_threshold < 0 || self.surge_limit < 0 {
            bail!("CROWD_THRESHOLD and CROWD_SURGE_LIMIT must not be negative");
        }
        if self.output_width == 0 || self.output_height == 0 {
            bail!("output frame size must be positive");
        }
        self.engine_config()
            .validate()
            .context("invalid engine configuration")?;
        Ok(())
    }

    /// Engine tunables with the service-level overrides applied
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig {
            skip_rate: self.skip_rate,
            equalize_contrast: self.equalize_contrast,
            ..EngineConfig::default()
        };
        engine.heatmap.decay = self.heatmap_decay;
        engine
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}
