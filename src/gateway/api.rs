use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Deserializer, Serialize};
use tonic::Code;

use super::GatewayState;
use crate::model::{Language, Submission};
use crate::proto::judge as pb;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageBody {
    pub name: String,
    pub source_file_name: String,
    pub compile_cmd: String,
    pub run_cmd: String,
    /// Either a list or one whitespace separated string.
    #[serde(default, deserialize_with = "executables")]
    pub executables: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CaseBody {
    pub input: String,
    pub answer: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub language: LanguageBody,
    pub source: String,
    #[serde(default)]
    pub cases: Vec<CaseBody>,
}

#[derive(Debug, Serialize)]
pub struct SubmitReply {
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmissionQuery {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct SubmissionsReply {
    pub submissions: Vec<Submission>,
}

fn executables<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(de)? {
        OneOrMany::One(s) => s.split_whitespace().map(str::to_string).collect(),
        OneOrMany::Many(v) => v,
    })
}

impl From<SubmitBody> for pb::SubmitRequest {
    fn from(body: SubmitBody) -> Self {
        let language = Language {
            name: body.language.name,
            source_file_name: body.language.source_file_name,
            compile_cmd: body.language.compile_cmd,
            run_cmd: body.language.run_cmd,
            executables: body.language.executables,
        };
        pb::SubmitRequest {
            language: Some(language.into()),
            source: body.source,
            cases: body
                .cases
                .into_iter()
                .map(|c| pb::TestCase {
                    input: c.input.into_bytes(),
                    answer: c.answer.into_bytes(),
                })
                .collect(),
        }
    }
}

/// Broker failure rendered as `{"error": ...}` with a matching HTTP status.
#[derive(Debug)]
pub struct ApiError(pub tonic::Status);

impl From<tonic::Status> for ApiError {
    fn from(status: tonic::Status) -> Self {
        Self(status)
    }
}

pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unavailable | Code::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(self.0.code());
        if status.is_server_error() {
            tracing::warn!(code = ?self.0.code(), error = %self.0.message(), "Broker call failed");
        }
        let body = serde_json::json!({ "error": self.0.message() });
        (status, Json(body)).into_response()
    }
}

pub async fn submit(
    State(state): State<GatewayState>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitReply>, ApiError> {
    let mut client = state.client.clone();
    let reply = client
        .submit(pb::SubmitRequest::from(body))
        .await?
        .into_inner();
    tracing::info!(submission_id = %reply.id, "Submission accepted");
    Ok(Json(SubmitReply { id: reply.id }))
}

pub async fn submissions(
    State(state): State<GatewayState>,
    Query(query): Query<SubmissionQuery>,
) -> Result<Json<SubmissionsReply>, ApiError> {
    let mut client = state.client.clone();
    let reply = client
        .submission(pb::SubmissionRequest { id: query.id })
        .await?
        .into_inner();
    let submissions = reply.submissions.into_iter().map(Submission::from).collect();
    Ok(Json(SubmissionsReply { submissions }))
}
