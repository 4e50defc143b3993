use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fetch::HttpClient;
use crate::model::{LocationUpdate, StopArrival, StopRecord};
use crate::services::backend_api::{ArrivalOutcome, BackendApi, BackendError, RemoteTripStatus};

/// PostgreSQL `unique_violation`, surfaced verbatim by PostgREST-style backends.
const UNIQUE_VIOLATION: &str = "23505";

/// PostgREST-style error payload.
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Serialize)]
struct TripStatusBody {
    status: RemoteTripStatus,
}

#[derive(Serialize)]
struct DelayBody<'a> {
    reason: &'a str,
    reported_at: DateTime<Utc>,
}

/// REST client for the tracking backend.
pub struct HttpBackend<C> {
    client: C,
    base_url: String,
    timeout: Duration,
}

impl<C: HttpClient> HttpBackend<C> {
    pub fn new(client: C, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<Request, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = Request::new(
            method,
            url.parse()
                .map_err(|e| BackendError::Encode(format!("invalid URL '{url}': {e}")))?,
        );
        *req.timeout_mut() = Some(self.timeout);

        if let Some(body) = body {
            let bytes = serde_json::to_vec(body).map_err(|e| BackendError::Encode(e.to_string()))?;
            req.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            *req.body_mut() = Some(bytes.into());
        }
        Ok(req)
    }

    async fn send(&self, req: Request) -> Result<(StatusCode, String), BackendError> {
        let method = req.method().clone();
        let url = req.url().to_string();

        let resp = self.client.execute(req).await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport_error(e))?;

        debug!(%method, %url, status = status.as_u16(), "Backend responded");
        Ok((status, body))
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Unreachable(e.to_string())
        }
    }
}

fn expect_success(status: StatusCode, body: String) -> Result<String, BackendError> {
    if status.is_success() {
        Ok(body)
    } else {
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn is_unique_violation(body: &str) -> bool {
    serde_json::from_str::<ErrorBody>(body)
        .is_ok_and(|e| e.code.as_deref() == Some(UNIQUE_VIOLATION))
}

/// Maps an arrival response, treating uniqueness conflicts as already recorded.
///
/// A conflict is a 409, or a 4xx whose JSON error `code` is the unique-violation
/// code. Anything else that is not a success keeps the arrival queued.
fn classify_arrival(status: StatusCode, body: String) -> Result<ArrivalOutcome, BackendError> {
    if status.is_success() {
        Ok(ArrivalOutcome::Recorded)
    } else if status == StatusCode::CONFLICT
        || (status.is_client_error() && is_unique_violation(&body))
    {
        Ok(ArrivalOutcome::Duplicate)
    } else {
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl<C: HttpClient> BackendApi for HttpBackend<C> {
    async fn record_location(&self, update: &LocationUpdate) -> Result<(), BackendError> {
        let req = self.request(Method::POST, "/bus-locations", Some(update))?;
        let (status, body) = self.send(req).await?;
        expect_success(status, body).map(|_| ())
    }

    async fn record_arrival(&self, arrival: &StopArrival) -> Result<ArrivalOutcome, BackendError> {
        let req = self.request(Method::POST, "/stop-arrivals", Some(arrival))?;
        let (status, body) = self.send(req).await?;
        classify_arrival(status, body)
    }

    async fn update_trip_status(
        &self,
        trip_id: i64,
        status: RemoteTripStatus,
    ) -> Result<(), BackendError> {
        let req = self.request(
            Method::PATCH,
            &format!("/trips/{trip_id}"),
            Some(&TripStatusBody { status }),
        )?;
        let (status, body) = self.send(req).await?;
        expect_success(status, body).map(|_| ())
    }

    async fn fetch_stops(&self, trip_id: i64) -> Result<Vec<StopRecord>, BackendError> {
        let req = self.request::<()>(Method::GET, &format!("/trips/{trip_id}/stops"), None)?;
        let (status, body) = self.send(req).await?;
        let body = expect_success(status, body)?;
        serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn report_delay(
        &self,
        trip_id: i64,
        reason: &str,
        reported_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let req = self.request(
            Method::POST,
            &format!("/trips/{trip_id}/delays"),
            Some(&DelayBody {
                reason,
                reported_at,
            }),
        )?;
        let (status, body) = self.send(req).await?;
        expect_success(status, body).map(|_| ())
    }
}
