use async_trait::async_trait;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::models::{BookAck, BookRequest, BookResponse, Booking, CancelRequest, ErrorBody};
use crate::slots::SlotQuery;

/// Fallback shown when the backend refuses without giving a reason.
const GENERIC_REJECTION: &str = "Не удалось записаться. Попробуйте позже.";

// ── Backend port ──

/// What the booking backend offers. The production implementation is
/// [`ApiClient`]; tests substitute mocks.
#[async_trait]
pub trait BookingApi: Send + Sync {
    /// Free slots for one day of one service variant, as raw ISO timestamps.
    async fn fetch_slots(&self, query: &SlotQuery) -> Result<Vec<String>, ApiError>;
    /// All bookings the backend holds for this customer name.
    async fn fetch_user_bookings(&self, name: &str) -> Result<Vec<Booking>, ApiError>;
    /// Every booking in the system. Operator-only on the caller's side.
    async fn fetch_records(&self) -> Result<Vec<Booking>, ApiError>;
    async fn book(&self, request: &BookRequest) -> Result<BookAck, ApiError>;
    async fn cancel(&self, request: &CancelRequest) -> Result<(), ApiError>;
}

#[async_trait]
impl<T: BookingApi + ?Sized> BookingApi for std::sync::Arc<T> {
    async fn fetch_slots(&self, query: &SlotQuery) -> Result<Vec<String>, ApiError> {
        (**self).fetch_slots(query).await
    }

    async fn fetch_user_bookings(&self, name: &str) -> Result<Vec<Booking>, ApiError> {
        (**self).fetch_user_bookings(name).await
    }

    async fn fetch_records(&self) -> Result<Vec<Booking>, ApiError> {
        (**self).fetch_records().await
    }

    async fn book(&self, request: &BookRequest) -> Result<BookAck, ApiError> {
        (**self).book(request).await
    }

    async fn cancel(&self, request: &CancelRequest) -> Result<(), ApiError> {
        (**self).cancel(request).await
    }
}

// ── HTTP client ──

/// Thin reqwest wrapper over the booking backend's REST surface.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: config.api_base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[async_trait]
impl BookingApi for ApiClient {
    async fn fetch_slots(&self, query: &SlotQuery) -> Result<Vec<String>, ApiError> {
        let response = self
            .http
            .get(self.url("/slots"))
            .query(&[
                ("day", query.day.format("%Y-%m-%d").to_string()),
                ("massageType", query.massage_type.clone()),
                ("duration", query.duration.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch_user_bookings(&self, name: &str) -> Result<Vec<Booking>, ApiError> {
        let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
        let response = self
            .http
            .get(self.url(&format!("/user-bookings/{encoded}")))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch_records(&self) -> Result<Vec<Booking>, ApiError> {
        let response = self
            .http
            .get(self.url("/records"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn book(&self, request: &BookRequest) -> Result<BookAck, ApiError> {
        let response = self
            .http
            .post(self.url("/book"))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;

        if !status.is_success() {
            tracing::warn!(%status, "booking rejected by backend");
            return Err(ApiError::Rejected(extract_reason(&raw)));
        }

        let body: BookResponse = serde_json::from_str(&raw)?;
        if !body.success {
            return Err(ApiError::Rejected(
                body.detail
                    .or(body.message)
                    .unwrap_or_else(|| GENERIC_REJECTION.to_string()),
            ));
        }
        Ok(BookAck {
            event_id: body.event_id,
        })
    }

    async fn cancel(&self, request: &CancelRequest) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.url("/cancel"))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let raw = response.text().await?;
        tracing::warn!(%status, "cancellation rejected by backend");
        Err(ApiError::Rejected(extract_reason(&raw)))
    }
}

/// Pull the backend's own reason out of an error body, falling back to a
/// generic message when the body is empty or unreadable.
fn extract_reason(raw: &str) -> String {
    serde_json::from_str::<ErrorBody>(raw)
        .ok()
        .and_then(|body| body.detail.or(body.message))
        .unwrap_or_else(|| GENERIC_REJECTION.to_string())
}

// ── Tests ──
