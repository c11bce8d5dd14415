use hyper::header::InvalidHeaderValue;
use thiserror::Error;

use crate::core::router::RouteError;

/// Errors raised by the administrative API and the dispatch pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("handler '{0}' not found")]
    HandlerNotFound(String),

    #[error("handler '{handler}' already has a target for '{url}'")]
    DuplicateTarget { handler: String, url: String },

    #[error("handler '{handler}' has no target '{target}'")]
    TargetNotFound { handler: String, target: String },

    #[error("invalid remote address '{0}'")]
    RemoteAddr(String),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("handler '{handler}' uses unknown middleware '{name}'")]
    UnknownMiddleware { handler: String, name: String },

    #[error("invalid target url '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("invalid handler configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid header value: {0}")]
    Header(#[from] InvalidHeaderValue),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
