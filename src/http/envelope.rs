//! The `{code, message, data}` envelope every successful handler response
//! is wrapped in. `code` is always `0` on success; error responses (built
//! from [`super::AppError`]) use the HTTP status code instead.

use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: i64,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            message: "ok".to_string(),
            data,
        })
    }
}
