use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tract_onnx::prelude::*;

use crate::models::{SymptomVector, SYMPTOM_COUNT};

/// Name of the encoder that turns class indices back into diagnoses.
const DIAGNOSIS_ENCODER: &str = "diagnosis";

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("ONNX model error: {0}")]
    Onnx(String),

    #[error("Model produced no {0} output")]
    MissingOutput(&'static str),

    #[error("Class index {0} is not a known label")]
    UnknownClass(i64),

    #[error("Inconsistent model artifacts: {0}")]
    Inconsistent(String),
}

impl From<TractError> for ModelError {
    fn from(e: TractError) -> Self {
        ModelError::Onnx(format!("{:#}", e))
    }
}

/// Raw classifier output for a single symptom vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: i64,
    /// One probability per class, in class-index order.
    pub probabilities: Vec<f32>,
}

pub trait Classifier: Send + Sync {
    fn classify(&self, symptoms: &SymptomVector) -> Result<Prediction, ModelError>;
}

/// A classifier exported to ONNX, taking a `[1, 20]` f32 batch.
///
/// The graph may expose an i64 label output next to the f32 probability
/// output. Without a label output the most probable class wins.
pub struct OnnxClassifier {
    plan: OnnxPlan,
}

impl OnnxClassifier {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ModelError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "model file not found"),
            });
        }
        let plan = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, SYMPTOM_COUNT)),
            )?
            .into_optimized()?
            .into_runnable()?;
        Ok(Self { plan })
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&self, symptoms: &SymptomVector) -> Result<Prediction, ModelError> {
        let input = tract_ndarray::Array2::from_shape_vec((1, SYMPTOM_COUNT), symptoms.to_features())
            .map_err(|e| ModelError::Onnx(e.to_string()))?
            .into_tensor();
        let outputs = self.plan.run(tvec!(input.into()))?;

        let mut label = None;
        let mut probabilities = None;
        for output in outputs.iter() {
            match output.datum_type() {
                DatumType::I64 if label.is_none() => {
                    label = output.as_slice::<i64>()?.first().copied();
                }
                DatumType::F32 if probabilities.is_none() => {
                    probabilities = Some(output.as_slice::<f32>()?.to_vec());
                }
                _ => {}
            }
        }

        let probabilities = probabilities.ok_or(ModelError::MissingOutput("probability"))?;
        let class_index = match label {
            Some(index) => index,
            None => argmax(&probabilities).ok_or(ModelError::MissingOutput("label"))?,
        };
        Ok(Prediction {
            class_index,
            probabilities,
        })
    }
}

fn argmax(values: &[f32]) -> Option<i64> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index as i64)
}

/// Inverse of a fitted label encoder: class index `i` is `classes[i]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelEncoder {
    pub fn inverse_transform(&self, index: i64) -> Result<&str, ModelError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.classes.get(i))
            .map(String::as_str)
            .ok_or(ModelError::UnknownClass(index))
    }
}

/// Label to class index, as saved next to the model.
pub type LabelMapping = BTreeMap<String, i64>;

fn check_mapping(encoder: &LabelEncoder, mapping: &LabelMapping) -> Result<(), ModelError> {
    if mapping.len() != encoder.classes.len() {
        return Err(ModelError::Inconsistent(format!(
            "label mapping has {} labels but the diagnosis encoder has {}",
            mapping.len(),
            encoder.classes.len()
        )));
    }
    for (label, &index) in mapping {
        let expected = encoder.inverse_transform(index)?;
        if expected != label {
            return Err(ModelError::Inconsistent(format!(
                "label mapping sends '{}' to {} but the encoder names it '{}'",
                label, index, expected
            )));
        }
    }
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ModelError> {
    let contents = fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ModelError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Locations of the three artifacts produced at training time.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    pub encoders: PathBuf,
    pub label_mapping: PathBuf,
}

/// Classifier plus the encoder that names its classes. Loaded once and only
/// read afterwards.
pub struct ModelArtifacts {
    classifier: Box<dyn Classifier>,
    labels: LabelEncoder,
}

impl ModelArtifacts {
    pub fn new(classifier: Box<dyn Classifier>, labels: LabelEncoder) -> Self {
        Self { classifier, labels }
    }

    pub fn load(paths: &ArtifactPaths) -> Result<Self, ModelError> {
        let labels = load_label_encoder(&paths.encoders, &paths.label_mapping)?;
        let classifier = OnnxClassifier::load(&paths.model)?;
        log::info!(
            "Loaded model {} with {} classes: {}",
            paths.model.display(),
            labels.classes.len(),
            labels.classes.join(", ")
        );
        Ok(Self::new(Box::new(classifier), labels))
    }

    /// Diagnosis label for one symptom vector.
    pub fn predict(&self, symptoms: &SymptomVector) -> Result<String, ModelError> {
        let prediction = self.classifier.classify(symptoms)?;
        Ok(self.labels.inverse_transform(prediction.class_index)?.to_string())
    }

    /// Diagnosis label plus the probability of every known label.
    pub fn predict_with_probabilities(
        &self,
        symptoms: &SymptomVector,
    ) -> Result<(String, BTreeMap<String, f32>), ModelError> {
        let prediction = self.classifier.classify(symptoms)?;
        let label = self.labels.inverse_transform(prediction.class_index)?.to_string();

        if prediction.probabilities.len() != self.labels.classes.len() {
            return Err(ModelError::Inconsistent(format!(
                "model returned {} probabilities for {} labels",
                prediction.probabilities.len(),
                self.labels.classes.len()
            )));
        }
        let probabilities = self
            .labels
            .classes
            .iter()
            .cloned()
            .zip(prediction.probabilities)
            .collect();
        Ok((label, probabilities))
    }
}

/// Reads the encoders and label mapping and checks they agree.
pub fn load_label_encoder(encoders: &Path, label_mapping: &Path) -> Result<LabelEncoder, ModelError> {
    let mut encoders: HashMap<String, LabelEncoder> = read_json(encoders)?;
    let labels = encoders.remove(DIAGNOSIS_ENCODER).ok_or_else(|| {
        ModelError::Inconsistent(format!("encoders file has no '{}' encoder", DIAGNOSIS_ENCODER))
    })?;
    if labels.classes.is_empty() {
        return Err(ModelError::Inconsistent("diagnosis encoder has no classes".into()));
    }
    let mapping: LabelMapping = read_json(label_mapping)?;
    check_mapping(&labels, &mapping)?;
    Ok(labels)
}
