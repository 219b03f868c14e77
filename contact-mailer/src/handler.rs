use crate::{
    compose::Composer,
    error::{MailError, ValidationError},
    mailer::{Delivery, MailSender},
    validation::ContactFormMessage,
};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

const MAX_BODY_BYTES: usize = 1024 * 1024;

const SUCCESS_MESSAGE: &str = "Message envoyé avec succès !";
const FAILURE_MESSAGE: &str =
    "Une erreur est survenue lors de l'envoi de l'email. Veuillez réessayer plus tard.";

#[derive(Clone)]
pub struct AppState {
    sender: Arc<dyn MailSender>,
    composer: Arc<Composer>,
}

impl AppState {
    pub fn new(sender: Arc<dyn MailSender>, composer: Composer) -> Self {
        Self {
            sender,
            composer: Arc::new(composer),
        }
    }

    async fn process_message(&self, message: ContactFormMessage) -> Result<Delivery, ContactError> {
        let submission = message.validate()?;
        let envelope = self.composer.compose(&submission)?;
        Ok(self.sender.send(&submission, &envelope).await?)
    }
}

/// Builds the HTTP surface of the contact service.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring unusable CORS origin {origin:?}");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins.clone()))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/mail/verify", get(verify))
        .route("/smtp/verify", get(verify))
        .route("/api/contact", post(contact))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(middleware::from_fn_with_state(
            Arc::new(origins),
            reject_unknown_origin,
        ))
        .with_state(state)
}

/// Refuses cross-origin requests from outside the allow-list. Requests without an `Origin`
/// header are not browser cross-origin requests and pass through.
async fn reject_unknown_origin(
    State(allowed): State<Arc<Vec<HeaderValue>>>,
    request: Request,
    next: Next,
) -> Response {
    match request.headers().get(header::ORIGIN) {
        Some(origin) if !allowed.contains(origin) => {
            warn!("Rejected request from origin {origin:?}");
            StatusCode::FORBIDDEN.into_response()
        }
        _ => next.run(request).await,
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn verify(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.sender.verify().await {
        Ok(via) => (StatusCode::OK, Json(json!({ "ok": true, "via": via }))),
        Err(error) => {
            error.log();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": error.to_string() })),
            )
        }
    }
}

async fn contact(State(state): State<AppState>, body: Bytes) -> Response {
    let message = ContactFormMessage::from_body(&body);
    match state.process_message(message).await {
        Ok(delivery) => {
            match delivery {
                Delivery::Sent { id } => info!("Contact message delivered ({id})"),
                Delivery::Queued { job_id } => info!("Contact message queued as job {job_id}"),
            }
            (StatusCode::OK, Json(json!({ "message": SUCCESS_MESSAGE }))).into_response()
        }
        Err(error) => {
            error.log();
            error.into_response()
        }
    }
}

#[derive(Debug)]
enum ContactError {
    Invalid(ValidationError),
    Mail(MailError),
}

impl From<ValidationError> for ContactError {
    fn from(error: ValidationError) -> Self {
        ContactError::Invalid(error)
    }
}

impl From<MailError> for ContactError {
    fn from(error: MailError) -> Self {
        ContactError::Mail(error)
    }
}

impl ContactError {
    fn log(&self) {
        match self {
            ContactError::Invalid(error) => info!("Rejected contact form submission: {error}"),
            ContactError::Mail(error) => error.log(),
        }
    }
}

impl IntoResponse for ContactError {
    fn into_response(self) -> Response {
        match self {
            ContactError::Invalid(error) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": error.client_message() })),
            )
                .into_response(),
            ContactError::Mail(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": FAILURE_MESSAGE })),
            )
                .into_response(),
        }
    }
}
