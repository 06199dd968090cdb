//! Serializable views of a loaded project, used by `inspect` and `history`.

use serde::Serialize;
use serde_json::Value;

use partseg::encoding::{encode_map, encode_mask_property};
use partseg::{HistoryElement, ProjectTuple};

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    pub file: String,
    pub image: ImageSummary,
    pub has_mask: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<SegmentationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<AlgorithmSummary>,
    pub history: Vec<StepSummary>,
}

#[derive(Debug, Serialize)]
pub struct ImageSummary {
    pub layers: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub channel_names: Vec<String>,
    pub spacing: [f64; 3],
    pub fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct SegmentationSummary {
    pub components: u32,
    pub foreground_voxels: usize,
    pub has_full_segmentation: bool,
}

#[derive(Debug, Serialize)]
pub struct AlgorithmSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub values: Value,
}

#[derive(Debug, Serialize)]
pub struct StepSummary {
    pub index: usize,
    pub algorithm: AlgorithmSummary,
    pub mask_property: Value,
    pub archive_bytes: usize,
}

impl AlgorithmSummary {
    fn from_choice(choice: &partseg::AlgorithmChoice) -> Self {
        Self {
            name: choice.name.clone(),
            version: choice.version.map(|v| v.to_string()),
            values: encode_map(&choice.values),
        }
    }
}

impl StepSummary {
    pub fn new(index: usize, element: &HistoryElement) -> Self {
        Self {
            index,
            algorithm: AlgorithmSummary::from_choice(element.algorithm()),
            mask_property: encode_mask_property(element.mask_property()),
            archive_bytes: element.array_bytes().len(),
        }
    }
}

impl ProjectSummary {
    pub fn new(file: &str, project: &ProjectTuple) -> Self {
        let image = &project.image;
        let [layers, height, width] = image.spatial_shape();
        let segmentation = project.segmentation.as_ref().map(|segmentation| SegmentationSummary {
            components: segmentation.iter().copied().max().unwrap_or(0),
            foreground_voxels: segmentation.iter().filter(|v| **v != 0).count(),
            has_full_segmentation: project.full_segmentation.is_some(),
        });
        Self {
            file: file.to_string(),
            image: ImageSummary {
                layers,
                height,
                width,
                channels: image.channels(),
                channel_names: image.channel_names().to_vec(),
                spacing: image.spacing(),
                fingerprint: format!("{:08x}", image.fingerprint()),
            },
            has_mask: project.mask.is_some(),
            segmentation,
            algorithm: project.algorithm.as_ref().map(AlgorithmSummary::from_choice),
            history: project
                .history
                .iter()
                .enumerate()
                .map(|(index, element)| StepSummary::new(index, element))
                .collect(),
        }
    }
}
