use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

/// Number of symptom slots the classifier was trained on.
pub const SYMPTOM_COUNT: usize = 20;

pub const PATIENTS_COLLECTION: &str = "patients";
pub const DIAGNOSIS_COLLECTION: &str = "Diagnosis";

const SYMPTOMS_LENGTH_MESSAGE: &str = "Symptoms data must contain exactly 20 values (0 atau 1)";

/// Name of the symptom at each position of a [`SymptomVector`].
pub fn symptom_names() -> Vec<String> {
    (1..=SYMPTOM_COUNT).map(|i| format!("gejala_{}", i)).collect()
}

/// Ordered 0/1 symptom flags, always exactly [`SYMPTOM_COUNT`] long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SymptomVector(Vec<u8>);

impl SymptomVector {
    /// Features in the dtype the classifier expects.
    pub fn to_features(&self) -> Vec<f32> {
        self.0.iter().map(|&v| f32::from(v)).collect()
    }
}

impl TryFrom<Vec<u8>> for SymptomVector {
    type Error = AppError;

    fn try_from(values: Vec<u8>) -> Result<Self, Self::Error> {
        if values.len() != SYMPTOM_COUNT {
            return Err(AppError::validation(SYMPTOMS_LENGTH_MESSAGE));
        }
        if let Some(pos) = values.iter().position(|&v| v > 1) {
            return Err(AppError::validation(format!(
                "Symptom value at position {} must be 0 or 1 (got {})",
                pos, values[pos]
            )));
        }
        Ok(SymptomVector(values))
    }
}

/// Treats absent and empty strings the same way.
fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Deserialize)]
pub struct RegisterPatientRequest {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "patientName")]
    pub patient_name: Option<String>,
}

impl RegisterPatientRequest {
    pub fn validate(self) -> Result<NewPatient, AppError> {
        let user_id = required(self.user_id).ok_or_else(|| AppError::validation("userId is required"))?;
        Ok(NewPatient {
            user_id,
            patient_name: self.patient_name,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DiagnoseRequest {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "patientId")]
    pub patient_id: Option<String>,
    pub symptoms: Option<Vec<u8>>,
}

/// A diagnose request that passed validation.
#[derive(Debug, Clone)]
pub struct DiagnoseInput {
    pub user_id: String,
    pub patient_id: String,
    pub symptoms: SymptomVector,
}

impl DiagnoseRequest {
    pub fn validate(self) -> Result<DiagnoseInput, AppError> {
        let missing = || AppError::validation("userId, patientId, and symptoms are required");
        let user_id = required(self.user_id).ok_or_else(missing)?;
        let patient_id = required(self.patient_id).ok_or_else(missing)?;
        let symptoms = self.symptoms.filter(|s| !s.is_empty()).ok_or_else(missing)?;
        Ok(DiagnoseInput {
            user_id,
            patient_id,
            symptoms: SymptomVector::try_from(symptoms)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TestPredictionRequest {
    pub symptoms: Option<Vec<u8>>,
}

impl TestPredictionRequest {
    pub fn validate(self) -> Result<SymptomVector, AppError> {
        let symptoms = self
            .symptoms
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::validation("symptoms are required"))?;
        SymptomVector::try_from(symptoms)
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "patientId")]
    pub patient_id: Option<String>,
}

impl HistoryQuery {
    /// Returns the user id and the optional patient filter.
    pub fn validate(self) -> Result<(String, Option<String>), AppError> {
        let user_id = required(self.user_id).ok_or_else(|| AppError::validation("userId is required"))?;
        Ok((user_id, required(self.patient_id)))
    }
}

/// Fields of a document in the `patients` collection. `registrationDate` is
/// assigned by the store.
#[derive(Debug, Serialize)]
pub struct NewPatient {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "patientName")]
    pub patient_name: Option<String>,
}

/// Fields of a document in the `Diagnosis` collection. `diagnosisDate` is
/// assigned by the store.
#[derive(Debug, Serialize)]
pub struct NewDiagnosis<'a> {
    #[serde(rename = "userId")]
    pub user_id: &'a str,
    #[serde(rename = "Patient_ID")]
    pub patient_id: &'a str,
    #[serde(rename = "gejala")]
    pub symptoms: &'a SymptomVector,
    pub diagnosis_result: &'a str,
}

pub const REGISTRATION_DATE_FIELD: &str = "registrationDate";
pub const DIAGNOSIS_DATE_FIELD: &str = "diagnosisDate";
pub const DIAGNOSIS_USER_FIELD: &str = "userId";
pub const DIAGNOSIS_PATIENT_FIELD: &str = "Patient_ID";

/// Serializes a record into the field map written to the store.
pub fn to_fields<T: Serialize>(record: &T) -> Result<Map<String, Value>, AppError> {
    match serde_json::to_value(record)? {
        Value::Object(fields) => Ok(fields),
        other => Err(AppError::Unhandled(format!(
            "record serialized to {} instead of an object",
            other
        ))),
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterPatientResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "patientId")]
    pub patient_id: String,
}

#[derive(Debug, Serialize)]
pub struct DiagnoseResponse {
    pub success: bool,
    #[serde(rename = "diagnosisId")]
    pub diagnosis_id: String,
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub diagnoses: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct TestPredictionResponse {
    pub success: bool,
    pub result: String,
    pub probabilities: BTreeMap<String, f32>,
}

#[derive(Debug, Serialize)]
pub struct SymptomNamesResponse {
    pub success: bool,
    pub symptom_names: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StoreProbeResponse {
    pub success: bool,
    pub data: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternating() -> Vec<u8> {
        (0..SYMPTOM_COUNT).map(|i| (i % 2) as u8).collect()
    }

    #[test]
    fn symptom_vector_requires_exact_length() {
        assert!(SymptomVector::try_from(vec![0; 19]).is_err());
        assert!(SymptomVector::try_from(vec![0; 21]).is_err());
        assert!(SymptomVector::try_from(alternating()).is_ok());
    }

    #[test]
    fn wrong_length_message_is_stable() {
        let err = SymptomVector::try_from(vec![1; 3]).unwrap_err();
        assert_eq!(err.to_string(), "Symptoms data must contain exactly 20 values (0 atau 1)");
    }

    #[test]
    fn symptom_vector_rejects_non_binary_values() {
        let mut values = alternating();
        values[7] = 2;
        let err = SymptomVector::try_from(values).unwrap_err();
        assert!(err.to_string().contains("position 7"));
    }

    #[test]
    fn symptom_vector_features_keep_order() {
        let vector = SymptomVector::try_from(alternating()).unwrap();
        let features = vector.to_features();
        assert_eq!(features[0], 0.0);
        assert_eq!(features[1], 1.0);
        assert_eq!(features.len(), SYMPTOM_COUNT);
    }

    #[test]
    fn diagnose_request_treats_empty_strings_as_missing() {
        let req = DiagnoseRequest {
            user_id: Some(String::new()),
            patient_id: Some("p1".into()),
            symptoms: Some(alternating()),
        };
        assert!(matches!(req.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn history_query_drops_empty_patient_filter() {
        let query = HistoryQuery {
            user_id: Some("u1".into()),
            patient_id: Some(String::new()),
        };
        assert_eq!(query.validate().unwrap(), ("u1".to_string(), None));
    }

    #[test]
    fn symptom_names_are_numbered_from_one() {
        let names = symptom_names();
        assert_eq!(names.len(), SYMPTOM_COUNT);
        assert_eq!(names[0], "gejala_1");
        assert_eq!(names[19], "gejala_20");
    }

    #[test]
    fn diagnosis_fields_use_stored_names() {
        let symptoms = SymptomVector::try_from(alternating()).unwrap();
        let fields = to_fields(&NewDiagnosis {
            user_id: "u1",
            patient_id: "p1",
            symptoms: &symptoms,
            diagnosis_result: "Glaucoma",
        })
        .unwrap();
        assert_eq!(fields["Patient_ID"], "p1");
        assert_eq!(fields["gejala"].as_array().unwrap().len(), SYMPTOM_COUNT);
        assert_eq!(fields["diagnosis_result"], "Glaucoma");
    }
}
