//! Person detectors: a YOLOv8 ONNX model and a scripted replay for demos/tests
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use common::crowd::{BoundingBox, Centroid, PersonDetection};
use image::RgbImage;
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait PersonDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Centroids of the people visible in `frame`. `frame_index` is the
    /// 1-based index of the decoded frame within the run.
    async fn detect(&self, frame_index: u64, frame: &RgbImage) -> Result<Vec<Centroid>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxDetectorConfig {
    /// Path to the YOLOv8 ONNX model file
    pub model_path: String,

    /// Confidence threshold for person detections (0.0 to 1.0)
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,

    /// IoU threshold for NMS
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Model input size (width and height)
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Execution provider (CPU, CUDA, TensorRT)
    #[serde(default = "default_execution_provider")]
    pub execution_provider: String,

    /// GPU device ID
    #[serde(default)]
    pub device_id: i32,

    #[serde(default = "default_threads")]
    pub intra_threads: usize,
}

fn default_confidence() -> f32 {
    0.4
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_input_size() -> u32 {
    640
}

fn default_execution_provider() -> String {
    "CPU".to_string()
}

fn default_threads() -> usize {
    4
}

impl OnnxDetectorConfig {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            confidence_threshold: default_confidence(),
            iou_threshold: default_iou_threshold(),
            input_size: default_input_size(),
            execution_provider: default_execution_provider(),
            device_id: 0,
            intra_threads: default_threads(),
        }
    }
}

/// YOLOv8 person detector (COCO class 0)
pub struct OnnxPersonDetector {
    config: OnnxDetectorConfig,
    session: Mutex<Session>,
}

impl OnnxPersonDetector {
    pub fn load(config: OnnxDetectorConfig) -> Result<Self> {
        if !Path::new(&config.model_path).exists() {
            bail!("model file not found: {}", config.model_path);
        }

        let (session, provider) = build_session(&config)?;
        info!(
            model = %config.model_path,
            provider,
            confidence = config.confidence_threshold,
            "loaded person detection model"
        );

        Ok(Self {
            config,
            session: Mutex::new(session),
        })
    }

    /// Resize to the model input and lay out as NCHW floats in [0, 1]
    fn preprocess(&self, frame: &RgbImage) -> Array<f32, IxDyn> {
        let size = self.config.input_size;
        let resized = image::imageops::resize(
            frame,
            size,
            size,
            image::imageops::FilterType::Triangle,
        );

        let mut input = Array::zeros(IxDyn(&[1, 3, size as usize, size as usize]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
            }
        }
        input
    }

    fn infer(&self, input: Array<f32, IxDyn>) -> Result<Array<f32, IxDyn>> {
        let tensor = Value::from_array(input)?;
        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("model session lock poisoned: {}", e))?;
        let outputs = session.run(ort::inputs![tensor])?;

        let output = outputs.get("output0").context("no output tensor found")?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let shape: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();
        Ok(Array::from_shape_vec(IxDyn(&shape), data.to_vec())?)
    }
}

#[async_trait]
impl PersonDetector for OnnxPersonDetector {
    fn name(&self) -> &'static str {
        "yolov8_onnx"
    }

    async fn detect(&self, _frame_index: u64, frame: &RgbImage) -> Result<Vec<Centroid>> {
        let input = self.preprocess(frame);
        let output = self.infer(input)?;
        let people = decode_people(&output, frame.width(), frame.height(), &self.config)?;
        Ok(people.iter().map(|p| p.bbox.center()).collect())
    }
}

fn build_session(config: &OnnxDetectorConfig) -> Result<(Session, &'static str)> {
    let cpu = || -> Result<Session> {
        Ok(Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(&config.model_path)?)
    };

    let preference = config.execution_provider.to_uppercase();
    let accelerated = match preference.as_str() {
        "TENSORRT" => Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ])?
            .commit_from_file(&config.model_path)
            .map(|s| (s, "TensorRT")),
        "CUDA" => Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .with_execution_providers([
                CUDAExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ])?
            .commit_from_file(&config.model_path)
            .map(|s| (s, "CUDA")),
        _ => return Ok((cpu()?, "CPU")),
    };

    match accelerated {
        Ok(found) => Ok(found),
        Err(e) => {
            warn!(provider = %preference, error = %e, "accelerated provider failed, using CPU");
            Ok((cpu()?, "CPU"))
        }
    }
}

/// Person boxes from a YOLOv8 `[1, 84, N]` output, scaled to the frame and
/// filtered by confidence and NMS
pub fn decode_people(
    output: &Array<f32, IxDyn>,
    frame_width: u32,
    frame_height: u32,
    config: &OnnxDetectorConfig,
) -> Result<Vec<PersonDetection>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[1] < 5 {
        bail!("unexpected model output shape {:?}", shape);
    }

    let scale_x = frame_width as f32 / config.input_size as f32;
    let scale_y = frame_height as f32 / config.input_size as f32;

    let mut candidates = Vec::new();
    for i in 0..shape[2] {
        let score = output[[0, 4, i]];
        if score < config.confidence_threshold {
            continue;
        }

        let cx = output[[0, 0, i]];
        let cy = output[[0, 1, i]];
        let w = output[[0, 2, i]];
        let h = output[[0, 3, i]];

        candidates.push(PersonDetection {
            bbox: BoundingBox {
                x: ((cx - w / 2.0) * scale_x).max(0.0),
                y: ((cy - h / 2.0) * scale_y).max(0.0),
                width: (w * scale_x).min(frame_width as f32),
                height: (h * scale_y).min(frame_height as f32),
            },
            confidence: score,
        });
    }

    Ok(non_max_suppression(candidates, config.iou_threshold))
}

/// Greedy NMS, highest confidence first
pub fn non_max_suppression(mut boxes: Vec<PersonDetection>, iou_threshold: f32) -> Vec<PersonDetection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<PersonDetection> = Vec::new();
    for candidate in boxes {
        if keep
            .iter()
            .all(|kept| iou(&kept.bbox, &candidate.bbox) < iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = if x2 > x1 && y2 > y1 {
        (x2 - x1) * (y2 - y1)
    } else {
        0.0
    };
    let union = a.width * a.height + b.width * b.height - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// One line of a detections script
#[derive(Debug, Deserialize)]
struct ScriptLine {
    frame: u64,
    #[serde(default)]
    centroids: Vec<(i32, i32)>,
}

/// Replays centroids recorded per decoded frame.
///
/// Each non-empty line is `{"frame": <index>, "centroids": [[x, y], ...]}`.
/// Frames that are not listed have nobody in them.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetector {
    frames: HashMap<u64, Vec<Centroid>>,
}

impl ScriptedDetector {
    pub fn new(frames: HashMap<u64, Vec<Centroid>>) -> Self {
        Self { frames }
    }

    pub fn parse(script: &str) -> Result<Self> {
        let mut frames = HashMap::new();
        for (n, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed: ScriptLine = serde_json::from_str(line)
                .with_context(|| format!("invalid detections on line {}", n + 1))?;
            frames.insert(
                parsed.frame,
                parsed.centroids.into_iter().map(Centroid::from).collect(),
            );
        }
        Ok(Self { frames })
    }

    pub async fn from_path(path: &str) -> Result<Self> {
        let script = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read detections file {}", path))?;
        let detector = Self::parse(&script)?;
        info!(path, frames = detector.frames.len(), "loaded scripted detections");
        Ok(detector)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl PersonDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn detect(&self, frame_index: u64, _frame: &RgbImage) -> Result<Vec<Centroid>> {
        Ok(self.frames.get(&frame_index).cloned().unwrap_or_default())
    }
}
