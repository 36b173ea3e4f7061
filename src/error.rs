use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::{database::StoreError, vote::VoteError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid vote request")]
    InvalidVote(#[from] VoteError),

    #[error("vote store failure")]
    Storage(#[from] StoreError),
}

impl IntoResponse for AppError {
    /// Collapse every rejection to a bare status code. The reason is
    /// logged server-side; clients only learn "rejected".
    fn into_response(self) -> Response {
        match self {
            AppError::InvalidVote(err) => {
                warn!("Rejected vote: {err}");
                StatusCode::BAD_REQUEST.into_response()
            }
            AppError::Storage(err) => {
                error!("Vote store failure: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
