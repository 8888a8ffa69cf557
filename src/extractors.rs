//! Request extractors whose rejections are `AppError`s, so a bad body, query
//! or path renders in the same JSON error shape as engine failures.

use axum::{
    extract::{FromRequest, FromRequestParts, Path as AxumPath, Query as AxumQuery, Request},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{AppError, msg};

/// Header carrying the caller's user id. Authentication happens upstream;
/// this service trusts the value.
pub const USER_ID_HEADER: &str = "x-user-id";

/// JSON body in, JSON body out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let axum::Json(value) = axum::Json::<T>::from_request(req, state).await?;
        Ok(Json(value))
    }
}

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

/// Wraps an axum parts extractor, converting its rejection into `AppError`.
macro_rules! parts_extractor {
    ($(#[$doc:meta])* $name:ident => $inner:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name<T>(pub T);

        impl<S, T> FromRequestParts<S> for $name<T>
        where
            S: Send + Sync,
            T: DeserializeOwned + Send,
        {
            type Rejection = AppError;

            async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
                let $inner(value) = $inner::<T>::from_request_parts(parts, state).await?;
                Ok($name(value))
            }
        }
    };
}

parts_extractor!(
    /// Query string parameters.
    Query => AxumQuery
);

parts_extractor!(
    /// Path segments.
    Path => AxumPath
);

/// The calling user, taken from the `X-User-Id` header.
///
/// A missing, non-numeric or non-positive header is rejected with 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub i64);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(UserId)
            .ok_or_else(|| {
                tracing::debug!("{}", msg::MISSING_USER_ID);
                AppError::Unauthorized
            })
    }
}
