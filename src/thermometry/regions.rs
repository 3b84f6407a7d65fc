use std::collections::BTreeMap;

use crate::data::nifti::Volume;

/// Voxels sharing one positive segmentation label.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub label: i64,
    /// Linear voxel indices, ascending.
    pub voxels: Vec<usize>,
}

impl Region {
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }
}

/// Regions of a label image, ascending by label. Only the first frame is read;
/// labels are rounded to the nearest integer and non-positive values are
/// background.
pub fn regions_from_segmentation(segmentation: &Volume) -> Vec<Region> {
    let mut by_label: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (voxel, &value) in segmentation.frame(0).iter().enumerate() {
        if !value.is_finite() {
            continue;
        }
        let label = value.round() as i64;
        if label > 0 {
            by_label.entry(label).or_default().push(voxel);
        }
    }
    by_label
        .into_iter()
        .map(|(label, voxels)| Region { label, voxels })
        .collect()
}
