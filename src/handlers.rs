use actix_web::{web, HttpResponse, Result};
use serde_json::json;

use crate::error::AppError;
use crate::models::{
    symptom_names, to_fields, DiagnoseRequest, DiagnoseResponse, HistoryQuery, HistoryResponse,
    NewDiagnosis, RegisterPatientRequest, RegisterPatientResponse, StoreProbeResponse,
    SymptomNamesResponse, TestPredictionRequest, TestPredictionResponse, DIAGNOSIS_COLLECTION,
    DIAGNOSIS_DATE_FIELD, DIAGNOSIS_PATIENT_FIELD, DIAGNOSIS_USER_FIELD, PATIENTS_COLLECTION,
    REGISTRATION_DATE_FIELD,
};
use crate::state::AppState;
use crate::store::FieldFilter;

const PROBE_COLLECTION: &str = "test_collection";
const PROBE_DOCUMENT: &str = "test_doc";

/// Registers every route plus the extractor configs that turn malformed
/// bodies and query strings into 400s.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| AppError::validation(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| AppError::validation(err.to_string()).into()),
    )
    .route("/", web::get().to(home))
    .route("/test_firestore", web::get().to(test_firestore))
    .route("/register_patient", web::post().to(register_patient))
    .route("/diagnose", web::post().to(diagnose))
    .route("/get_diagnosis_history", web::get().to(get_diagnosis_history))
    .route("/test_prediction", web::post().to(test_prediction))
    .route("/symptom_names", web::get().to(get_symptom_names));
}

pub async fn home() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body("Glaucoma Diagnosis API is running!")
}

/// Writes a fixed document and reads it back.
pub async fn test_firestore(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let doc = web::block(move || -> Result<_, AppError> {
        let fields = to_fields(&json!({ "message": "Firestore connection successful!" }))?;
        state.store.set(PROBE_COLLECTION, PROBE_DOCUMENT, fields, &[])?;
        state
            .store
            .get(PROBE_COLLECTION, PROBE_DOCUMENT)?
            .ok_or_else(|| AppError::Unhandled("test document was not found after writing it".into()))
    })
    .await??;

    Ok(HttpResponse::Ok().json(StoreProbeResponse {
        success: true,
        data: doc.fields,
    }))
}

pub async fn register_patient(
    state: web::Data<AppState>,
    body: web::Json<RegisterPatientRequest>,
) -> Result<HttpResponse, AppError> {
    let patient = body.into_inner().validate()?;

    let patient_id = web::block(move || -> Result<String, AppError> {
        let fields = to_fields(&patient)?;
        Ok(state
            .store
            .create(PATIENTS_COLLECTION, fields, &[REGISTRATION_DATE_FIELD])?)
    })
    .await??;

    log::info!("Registered patient {}", patient_id);
    Ok(HttpResponse::Ok().json(RegisterPatientResponse {
        success: true,
        message: "Patient registered successfully".to_string(),
        patient_id,
    }))
}

pub async fn diagnose(
    state: web::Data<AppState>,
    body: web::Json<DiagnoseRequest>,
) -> Result<HttpResponse, AppError> {
    let input = body.into_inner().validate()?;

    let (diagnosis_id, result) = web::block(move || -> Result<(String, String), AppError> {
        let result = state.artifacts.predict(&input.symptoms)?;
        let fields = to_fields(&NewDiagnosis {
            user_id: &input.user_id,
            patient_id: &input.patient_id,
            symptoms: &input.symptoms,
            diagnosis_result: &result,
        })?;
        let id = state
            .store
            .create(DIAGNOSIS_COLLECTION, fields, &[DIAGNOSIS_DATE_FIELD])?;
        Ok((id, result))
    })
    .await??;

    log::info!("Diagnosis {} recorded: {}", diagnosis_id, result);
    Ok(HttpResponse::Ok().json(DiagnoseResponse {
        success: true,
        diagnosis_id,
        result,
    }))
}

pub async fn get_diagnosis_history(
    state: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let (user_id, patient_id) = query.into_inner().validate()?;

    let mut filters = vec![FieldFilter::equals(DIAGNOSIS_USER_FIELD, user_id)];
    if let Some(patient_id) = patient_id {
        filters.push(FieldFilter::equals(DIAGNOSIS_PATIENT_FIELD, patient_id));
    }

    let documents = web::block(move || state.store.query(DIAGNOSIS_COLLECTION, &filters)).await??;

    Ok(HttpResponse::Ok().json(HistoryResponse {
        success: true,
        diagnoses: documents
            .into_iter()
            .map(|doc| doc.into_map_with_id())
            .collect(),
    }))
}

/// Prediction with the full probability table; nothing is stored.
pub async fn test_prediction(
    state: web::Data<AppState>,
    body: web::Json<TestPredictionRequest>,
) -> Result<HttpResponse, AppError> {
    let symptoms = body.into_inner().validate()?;

    let (result, probabilities) =
        web::block(move || state.artifacts.predict_with_probabilities(&symptoms)).await??;

    log::info!("Test prediction: {}", result);
    Ok(HttpResponse::Ok().json(TestPredictionResponse {
        success: true,
        result,
        probabilities,
    }))
}

pub async fn get_symptom_names() -> HttpResponse {
    HttpResponse::Ok().json(SymptomNamesResponse {
        success: true,
        symptom_names: symptom_names(),
    })
}
