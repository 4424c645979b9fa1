//! Ordered class names. The index of a label is the contract with the model
//! output vector; reordering or editing the list breaks that contract.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::error::ConfigError;

/// Class names of the bundled 33-class leaf disease model, in output order.
pub const PLANT_VILLAGE_LABELS: [&str; 33] = [
    "Apple scab",
    "Apple Black rot",
    "Apple Cedar apple rust",
    "Apple healthy",
    "Cherry Powdery mildew",
    "Cherry healthy",
    "Corn Cercospora leaf spot Gray leaf spot",
    "Corn Common rust",
    "Corn Northern Leaf Blight",
    "Corn healthy",
    "Grape Black rot",
    "Grape Esca",
    "Grape Leaf blight",
    "Grape healthy",
    "Peach Bacterial spot",
    "Peach healthy",
    "Pepper bell Bacterial spot",
    "Pepper bell healthy",
    "Potato Early blight",
    "Potato Late blight",
    "Potato healthy",
    "Strawberry Leaf scorch",
    "Strawberry healthy",
    "Tomato Bacterial spot",
    "Tomato Early blight",
    "Tomato Late blight",
    "Tomato Leaf Mold",
    "Tomato Septoria leaf spot",
    "Tomato Spider mites",
    "Tomato Target Spot",
    "Tomato Yellow Leaf Curl Virus",
    "Tomato mosaic virus",
    "Tomato healthy",
];

static PLANT_VILLAGE: Lazy<Arc<LabelSet>> = Lazy::new(|| {
    Arc::new(LabelSet {
        labels: PLANT_VILLAGE_LABELS.iter().map(|l| l.to_string()).collect(),
    })
});

/// Immutable, ordered list of (plant, condition) class names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    /// The process-wide built-in label set.
    pub fn plant_village() -> Arc<LabelSet> {
        Arc::clone(&PLANT_VILLAGE)
    }

    /// Reads one label per line. Blank lines are skipped; order is kept as is.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let labels: Vec<String> = raw
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect();
        if labels.is_empty() {
            return Err(ConfigError::EmptyLabels(path.to_path_buf()));
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Whether the class at `index` denotes a healthy leaf.
    pub fn is_healthy(&self, index: usize) -> bool {
        self.get(index)
            .is_some_and(|l| l.to_ascii_lowercase().ends_with("healthy"))
    }

    /// Distinct plant names (first word of each label), in label order.
    pub fn supported_plants(&self) -> Vec<&str> {
        let mut plants: Vec<&str> = Vec::new();
        for plant in self.labels.iter().filter_map(|l| l.split_whitespace().next()) {
            if !plants.contains(&plant) {
                plants.push(plant);
            }
        }
        plants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn builtin_set_has_33_labels_in_model_order() {
        let set = LabelSet::plant_village();
        assert_eq!(set.len(), 33);
        assert_eq!(set.get(0), Some("Apple scab"));
        assert_eq!(set.get(32), Some("Tomato healthy"));
        assert_eq!(set.get(33), None);
    }

    #[test]
    fn supported_plants_are_distinct_and_ordered() {
        let set = LabelSet::plant_village();
        assert_eq!(
            set.supported_plants(),
            vec![
                "Apple",
                "Cherry",
                "Corn",
                "Grape",
                "Peach",
                "Pepper",
                "Potato",
                "Strawberry",
                "Tomato"
            ]
        );
    }

    #[test]
    fn healthy_classes_are_detected() {
        let set = LabelSet::plant_village();
        assert!(set.is_healthy(3));
        assert!(!set.is_healthy(0));
        assert!(!set.is_healthy(99));
    }

    #[test]
    fn label_file_skips_blank_lines() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "Rose healthy\n\n  Rose rust  \n")?;
        let set = LabelSet::from_file(file.path())?;
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["Rose healthy", "Rose rust"]);
        Ok(())
    }

    #[test]
    fn empty_label_file_is_rejected() -> anyhow::Result<()> {
        let file = NamedTempFile::new()?;
        let err = LabelSet::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyLabels(_)));
        Ok(())
    }
}
