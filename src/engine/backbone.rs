//! Feature extraction backbone
//!
//! The backbone turns an input image into a grid of patch embeddings. The
//! engine only relies on the [`Backbone`] trait; [`OpenVinoBackbone`] runs an
//! exported convolutional feature extractor through OpenVINO.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use half::f16;
use image::RgbImage;
use ndarray::{Array2, ArrayView2};
use openvino::{CompiledModel, Core, DeviceType, ElementType, RwPropertyKey, Shape, Tensor};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

use super::device::{DeviceContext, DeviceKind, DeviceProbe, Precision};
use super::preprocess::image_to_nchw;

/// Backbone file names probed in a model directory, in order
pub const BACKBONE_FILES: [&str; 2] = ["backbone.xml", "backbone.onnx"];

/// Patch embeddings laid out row-major over a `rows x cols` grid.
#[derive(Debug, Clone)]
pub struct PatchGrid {
    rows: usize,
    cols: usize,
    /// Shape (rows * cols, dim)
    patches: Array2<f32>,
}

impl PatchGrid {
    pub fn new(rows: usize, cols: usize, patches: Array2<f32>) -> Result<Self> {
        if patches.nrows() != rows * cols {
            return Err(EngineError::Backbone(format!(
                "{} patches cannot fill a {}x{} grid",
                patches.nrows(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, patches })
    }

    /// Rearrange an NCHW feature map (batch 1) into one embedding per position.
    pub fn from_feature_map(data: &[f32], channels: usize, rows: usize, cols: usize) -> Result<Self> {
        let plane = rows * cols;
        if data.len() != channels * plane {
            return Err(EngineError::Backbone(format!(
                "feature map has {} values, expected {}x{}x{}",
                data.len(),
                channels,
                rows,
                cols
            )));
        }

        let mut patches = Array2::<f32>::zeros((plane, channels));
        for c in 0..channels {
            let channel = &data[c * plane..(c + 1) * plane];
            for (p, &v) in channel.iter().enumerate() {
                patches[[p, c]] = v;
            }
        }
        Self::new(rows, cols, patches)
    }

    /// Grid shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn dim(&self) -> usize {
        self.patches.ncols()
    }

    pub fn patches(&self) -> ArrayView2<'_, f32> {
        self.patches.view()
    }
}

/// Black-box patch embedder.
pub trait Backbone: Send + Sync {
    /// Embed an image already sized to the model input.
    fn embed(&self, image: &RgbImage, device: &DeviceContext) -> Result<PatchGrid>;

    /// Release transient device memory. Called after each GPU prediction.
    fn reclaim(&self) {}
}

/// Loads a model's backbone onto an acquired device.
pub trait BackboneLoader: Send + Sync {
    fn load(&self, model_dir: &Path, device: &DeviceContext) -> Result<Arc<dyn Backbone>>;

    fn probe(&self) -> &dyn DeviceProbe;
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync
struct SafeCompiledModel(CompiledModel);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

/// Backbone compiled by OpenVINO for one device.
pub struct OpenVinoBackbone {
    compiled: Mutex<SafeCompiledModel>,
    device: DeviceKind,
}

impl OpenVinoBackbone {
    pub fn load(path: &Path, device: DeviceKind, precision: Precision) -> Result<Self> {
        info!("Loading backbone {:?} on {} ({:?} precision)", path, device, precision);
        let compiled = compile(path, device, precision)?;
        Ok(Self {
            compiled: Mutex::new(SafeCompiledModel(compiled)),
            device,
        })
    }
}

impl Backbone for OpenVinoBackbone {
    fn embed(&self, image: &RgbImage, _device: &DeviceContext) -> Result<PatchGrid> {
        let (width, height) = image.dimensions();
        let input_tensor = image_to_nchw(image);

        let mut request = {
            let mut compiled = self.compiled.lock();
            compiled.0.create_infer_request().map_err(backbone_err)?
        };

        let input_shape = Shape::new(&[1, 3, height as i64, width as i64]).map_err(backbone_err)?;
        let mut input = Tensor::new(ElementType::F32, &input_shape).map_err(backbone_err)?;

        let input_data = input_tensor
            .as_slice()
            .ok_or_else(|| EngineError::Backbone("input tensor is not contiguous".to_string()))?;
        unsafe {
            let tensor_data = input.get_raw_data_mut().map_err(backbone_err)?.as_mut_ptr() as *mut f32;
            std::ptr::copy_nonoverlapping(input_data.as_ptr(), tensor_data, input_data.len());
        }

        request.set_input_tensor(&input).map_err(backbone_err)?;
        request.infer().map_err(backbone_err)?;

        let output = request.get_output_tensor().map_err(backbone_err)?;
        let dims: Vec<i64> = output
            .get_shape()
            .map_err(backbone_err)?
            .get_dimensions()
            .to_vec();
        if dims.len() != 4 || dims[0] != 1 {
            return Err(EngineError::Backbone(format!(
                "expected a [1, C, H, W] feature map, got {:?}",
                dims
            )));
        }
        let (channels, rows, cols) = (dims[1] as usize, dims[2] as usize, dims[3] as usize);

        // Half precision models may declare an f16 output; scoring stays f32
        let output_data: Vec<f32> = match output.get_element_type().map_err(backbone_err)? {
            ElementType::F32 => output.get_data::<f32>().map_err(backbone_err)?.to_vec(),
            ElementType::F16 => widen_half(output.get_data::<f16>().map_err(backbone_err)?),
            other => {
                return Err(EngineError::Backbone(format!(
                    "unsupported feature map element type {:?}",
                    other
                )))
            }
        };

        let grid = PatchGrid::from_feature_map(&output_data, channels, rows, cols)?;
        debug!("Embedded {}x{} grid of {} dims on {}", rows, cols, channels, self.device);
        Ok(grid)
    }
}

/// Loads `backbone.xml` or `backbone.onnx` from the model directory.
#[derive(Debug, Default, Clone)]
pub struct OpenVinoLoader;

impl OpenVinoLoader {
    pub fn new() -> Self {
        Self
    }

    fn backbone_path(model_dir: &Path) -> Result<PathBuf> {
        BACKBONE_FILES
            .iter()
            .map(|name| model_dir.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| EngineError::ArtifactMissing {
                path: model_dir.join(BACKBONE_FILES[1]),
            })
    }
}

impl DeviceProbe for OpenVinoLoader {
    fn probe_gpu(&self, model_dir: &Path, device_id: u32) -> std::result::Result<(), String> {
        let path = Self::backbone_path(model_dir).map_err(|e| e.to_string())?;
        compile(&path, DeviceKind::Gpu(device_id), Precision::Full)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

impl BackboneLoader for OpenVinoLoader {
    fn load(&self, model_dir: &Path, device: &DeviceContext) -> Result<Arc<dyn Backbone>> {
        let path = Self::backbone_path(model_dir)?;
        Ok(Arc::new(OpenVinoBackbone::load(
            &path,
            device.kind(),
            device.precision(),
        )?))
    }

    fn probe(&self) -> &dyn DeviceProbe {
        self
    }
}

/// OpenVINO `INFERENCE_PRECISION_HINT` for a device. CPU keeps the plugin default.
fn inference_precision(device: DeviceKind, precision: Precision) -> Option<&'static str> {
    match (device, precision) {
        (DeviceKind::Cpu, _) => None,
        (DeviceKind::Gpu(_), Precision::Mixed) => Some("f16"),
        (DeviceKind::Gpu(_), Precision::Full) => Some("f32"),
    }
}

fn compile(path: &Path, device: DeviceKind, precision: Precision) -> Result<CompiledModel> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::InvalidConfig(format!("non UTF-8 path {:?}", path)))?;
    let device_name = device.runtime_name();
    let device_type = DeviceType::from(device_name.as_str());

    let mut core = Core::new().map_err(backbone_err)?;
    if let Some(hint) = inference_precision(device, precision) {
        core.set_property(&device_type, &RwPropertyKey::HintInferencePrecision, hint)
            .map_err(backbone_err)?;
    }
    let model = core.read_model_from_file(path_str, "").map_err(backbone_err)?;
    core.compile_model(&model, device_type).map_err(backbone_err)
}

fn widen_half(values: &[f16]) -> Vec<f32> {
    values.iter().map(|v| v.to_f32()).collect()
}

fn backbone_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Backbone(e.to_string())
}
