// Error handling for the server HTTP surface
// Domain errors render as the `{code, message, data}` envelope

use std::fmt::{Display, Formatter};

use actix_web::HttpResponse;
use actix_web::http::StatusCode;
use teller_api::RestResult;
use teller_common::TellerError;
use teller_common::error::SERVER_ERROR;

// Local wrapper for application errors to implement actix-web error handling
#[derive(Debug)]
pub struct AppError {
    inner: anyhow::Error,
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError { inner: value }
    }
}

impl From<TellerError> for AppError {
    fn from(value: TellerError) -> Self {
        AppError {
            inner: anyhow::Error::new(value),
        }
    }
}

impl AppError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn teller_error(&self) -> Option<&TellerError> {
        self.inner.downcast_ref::<TellerError>()
    }
}

impl actix_web::error::ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.teller_error()
            .and_then(|e| StatusCode::from_u16(e.status_code()).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let body: RestResult<()> = match self.teller_error() {
            Some(e) => RestResult::from_error(e),
            None => {
                tracing::error!("Unhandled error: {:#}", self.inner);
                RestResult::err(SERVER_ERROR, self.inner.to_string())
            }
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
