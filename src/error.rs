use thiserror::Error;

use crate::api::ApiError;
use crate::stream::client::StreamError;

/// Payload of the `error` notification category.
///
/// REST failures and stream handshake failures share the category, so both
/// surfaces are folded into one type.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
