//! ONNX layout model.
//!
//! A YOLO-style detector trained on document layouts (DocLayNet label
//! space), loaded from a model file supplied by the host. Predictions are
//! decoded from the `[1, 15, 21504]` output head, thresholded, and
//! deduplicated with relaxed-IoU NMS before the detector maps labels into
//! the invoice block set.

use std::path::Path;

use anyhow::Context;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use lazy_static::lazy_static;
use ndarray::{s, Array4, ArrayBase, Axis, Dim, OwnedRepr};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};

use crate::engines::{LayoutModel, ModelDetection};
use crate::entities::BBox;

lazy_static! {
    static ref ID2LABEL: [&'static str; 11] = [
        "Caption",
        "Footnote",
        "Formula",
        "List-item",
        "Page-footer",
        "Page-header",
        "Picture",
        "Section-header",
        "Table",
        "Text",
        "Title",
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrtExecutionProvider {
    Cpu,
    CoreMl { ane_only: bool },
    Cuda(i32),
    Trt(i32),
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub execution_providers: Vec<OrtExecutionProvider>,
    pub intra_threads: usize,
    pub inter_threads: usize,
}

impl Default for OrtConfig {
    fn default() -> Self {
        Self {
            execution_providers: vec![OrtExecutionProvider::Cpu],
            intra_threads: OrtLayoutModel::ORT_INTRATHREAD,
            inter_threads: OrtLayoutModel::ORT_INTERTHREAD,
        }
    }
}

#[derive(Debug)]
pub struct OrtLayoutModel {
    session: Session,
    output_name: String,
}

impl OrtLayoutModel {
    /// Required input size for the detector.
    pub const REQUIRED_WIDTH: u32 = 1024;
    pub const REQUIRED_HEIGHT: u32 = 1024;

    // Output head: [batch = 1, bbox(4) + classes(11), candidate boxes].
    const OUTPUT_SIZE: [usize; 3] = [1, 15, 21504];

    /// Detections under this probability are discarded.
    pub const CONF_THRESHOLD: f32 = 0.3;
    /// Relaxed-IoU above this suppresses the lower-probability box.
    pub const IOU_THRESHOLD: f32 = 0.8;

    pub const ORT_INTRATHREAD: usize = 16;
    pub const ORT_INTERTHREAD: usize = 4;

    pub fn from_file(model_path: &Path, config: OrtConfig) -> anyhow::Result<Self> {
        let mut execution_providers = Vec::new();
        let mut providers = config.execution_providers;
        providers.sort();

        for provider in providers {
            match provider {
                OrtExecutionProvider::Trt(device_id) => execution_providers.push(
                    TensorRTExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                ),
                OrtExecutionProvider::Cuda(device_id) => execution_providers.push(
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                ),
                OrtExecutionProvider::CoreMl { ane_only } => {
                    let provider = CoreMLExecutionProvider::default();
                    let provider = if ane_only {
                        provider.with_ane_only().build()
                    } else {
                        provider.build()
                    };
                    execution_providers.push(provider)
                }
                OrtExecutionProvider::Cpu => {
                    execution_providers.push(CPUExecutionProvider::default().build());
                }
            }
        }

        let session = Session::builder()?
            .with_execution_providers(execution_providers)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .with_inter_threads(config.inter_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("loading layout model from {}", model_path.display()))?;

        let output_name = session
            .outputs
            .first()
            .map(|o| &o.name)
            .context("layout model has no outputs")?
            .to_owned();

        Ok(Self {
            session,
            output_name,
        })
    }

    fn run(
        &self,
        input: ArrayBase<OwnedRepr<f32>, Dim<[usize; 4]>>,
    ) -> anyhow::Result<ArrayBase<OwnedRepr<f32>, Dim<[usize; 3]>>> {
        let outputs = &self.session.run(ort::inputs![input]?)?;

        let output_tensor = outputs
            .get(&self.output_name)
            .context("missing layout model output")?
            .try_extract_tensor::<f32>()?;

        Ok(output_tensor
            .to_shape(Self::OUTPUT_SIZE)
            .context("unexpected layout model output shape")?
            .to_owned())
    }

    /// Letterbox into the required input size on a neutral background.
    fn preprocess(&self, img: &DynamicImage) -> Array4<f32> {
        let (w0, h0) = img.dimensions();
        let ratio = (Self::REQUIRED_WIDTH as f32 / w0 as f32)
            .min(Self::REQUIRED_HEIGHT as f32 / h0 as f32);
        let (w_new, h_new) = (
            (w0 as f32 * ratio).round() as u32,
            (h0 as f32 * ratio).round() as u32,
        );
        let resized_img = img.resize_exact(w_new, h_new, FilterType::Triangle);

        let mut input_tensor = Array4::ones([
            1,
            3,
            Self::REQUIRED_HEIGHT as usize,
            Self::REQUIRED_WIDTH as usize,
        ]);
        input_tensor.fill(144.0 / 255.0);
        for (x, y, pixel) in resized_img.pixels() {
            let x = x as usize;
            let y = y as _;
            let [r, g, b, _] = pixel.0;
            input_tensor[[0, 0, y, x]] = r as f32 / 255.0;
            input_tensor[[0, 1, y, x]] = g as f32 / 255.0;
            input_tensor[[0, 2, y, x]] = b as f32 / 255.0;
        }
        input_tensor
    }

    fn extract_detections(
        &self,
        output: ArrayBase<OwnedRepr<f32>, Dim<[usize; 3]>>,
        original_width: u32,
        original_height: u32,
    ) -> Vec<ModelDetection> {
        const CXYWH_OFFSET: usize = 4;
        let mut result = Vec::new();
        let output = output.slice(s![0, .., ..]);

        for prediction in output.axis_iter(Axis(1)) {
            let bbox = prediction.slice(s![0..CXYWH_OFFSET]);
            let classes = prediction.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + ID2LABEL.len()]);
            let (max_prob_idx, &score) = classes
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .unwrap();

            if score < Self::CONF_THRESHOLD {
                continue;
            }

            let ratio = (Self::REQUIRED_WIDTH as f32 / original_width as f32)
                .min(Self::REQUIRED_HEIGHT as f32 / original_height as f32);
            let xc = bbox[0_usize] / ratio;
            let yc = bbox[1_usize] / ratio;
            let w = bbox[2_usize] / ratio;
            let h = bbox[3_usize] / ratio;
            let x0 = (xc - (w / 2.0)).clamp(0f32, original_width as f32);
            let y0 = (yc - (h / 2.0)).clamp(0f32, original_height as f32);
            let x1 = (xc + (w / 2.0)).clamp(0f32, original_width as f32);
            let y1 = (yc + (h / 2.0)).clamp(0f32, original_height as f32);

            if x0 >= x1 || y0 >= y1 {
                continue;
            }

            result.push(ModelDetection {
                label: ID2LABEL[max_prob_idx].to_owned(),
                bbox: BBox { x0, y0, x1, y1 },
                score,
            });
        }

        result
    }
}

impl LayoutModel for OrtLayoutModel {
    fn detect(&self, page: &DynamicImage) -> anyhow::Result<Vec<ModelDetection>> {
        let (img_width, img_height) = (page.width(), page.height());
        let input = self.preprocess(page);
        let output = self.run(input)?;
        let mut detections = self.extract_detections(output, img_width, img_height);
        nms(&mut detections, Self::IOU_THRESHOLD);
        Ok(detections)
    }
}

/// Class-agnostic NMS over relaxed IoU, keeping higher-probability boxes.
pub fn nms(detections: &mut Vec<ModelDetection>, iou_threshold: f32) {
    detections.sort_by(|r1, r2| r2.score.partial_cmp(&r1.score).unwrap());
    let mut current_index = 0;
    for index in 0..detections.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = detections[prev_index]
                .bbox
                .relaxed_iou(&detections[index].bbox);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            detections.swap(current_index, index);
            current_index += 1;
        }
    }
    // Everything after has been swapped out.
    detections.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x0: f32, y0: f32, x1: f32, y1: f32, score: f32) -> ModelDetection {
        ModelDetection {
            label: "Text".to_owned(),
            bbox: BBox { x0, y0, x1, y1 },
            score,
        }
    }

    #[test]
    fn test_nms_high_overlap_contained_box() {
        let mut detections = vec![
            detection(0.0, 0.0, 3.0, 3.0, 0.85),
            // Fully contained within the first box.
            detection(1.0, 1.0, 2.0, 2.0, 0.95),
        ];
        nms(&mut detections, 0.5);
        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn test_nms_no_overlap() {
        let mut detections = vec![
            detection(0.0, 0.0, 1.0, 1.0, 0.9),
            detection(2.0, 2.0, 3.0, 3.0, 0.95),
            detection(4.0, 4.0, 5.0, 5.0, 0.85),
        ];
        nms(&mut detections, 0.5);
        assert_eq!(detections.len(), 3);
    }

    #[test]
    fn test_nms_keeps_highest_probability() {
        let mut detections = vec![
            detection(0.0, 0.0, 2.0, 2.0, 0.85),
            detection(0.5, 0.5, 2.0, 2.0, 0.95),
            detection(0.0, 0.0, 2.0, 2.0, 0.90),
        ];
        nms(&mut detections, 0.5);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].score, 0.95);
    }
}
