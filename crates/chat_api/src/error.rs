use std::fmt;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Error as JsonError, Value};

use crate::events::StreamFailure;

#[derive(Debug)]
pub enum ChatApiError {
    InvalidBaseUrl(String),
    InvalidHeader(String),
    InvalidRequest(String),
    Request(reqwest::Error),
    Status {
        status: StatusCode,
        api_code: Option<i64>,
        error_detail_code: Option<String>,
        message: String,
    },
    MalformedFrame(String),
    Serde(JsonError),
    StreamEnded,
    Cancelled,
}

impl ChatApiError {
    /// Classifies the error for the failed-send surface.
    #[must_use]
    pub fn into_failure(self) -> StreamFailure {
        match self {
            Self::Request(error) => StreamFailure::network(describe_request_error(&error)),
            Self::Status {
                status,
                api_code,
                error_detail_code,
                message,
            } => StreamFailure::Api {
                http_status: Some(status.as_u16()),
                api_code,
                error_detail_code,
                message: Some(message),
            },
            Self::Cancelled => StreamFailure::network("request was cancelled"),
            other => StreamFailure::protocol(other.to_string()),
        }
    }
}

impl fmt::Display for ChatApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBaseUrl(value) => write!(f, "invalid base URL: {value}"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::InvalidRequest(message) => write!(f, "invalid request payload: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status {
                status, message, ..
            } => write!(f, "HTTP {status} {message}"),
            Self::MalformedFrame(message) => write!(f, "malformed stream frame: {message}"),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::StreamEnded => write!(f, "stream ended before a terminal frame"),
            Self::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl std::error::Error for ChatApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(error) => Some(error),
            Self::Serde(error) => Some(error),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChatApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<JsonError> for ChatApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

/// Error fields shared by non-2xx bodies and `error` stream frames.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiErrorFields {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default, alias = "error_code", alias = "detailCode")]
    pub error_code: Option<String>,
    #[serde(default, alias = "msg")]
    pub message: Option<String>,
}

impl ApiErrorFields {
    /// Numeric `code` is the API code; a string `code` doubles as the
    /// detail code when no explicit one is present.
    pub fn codes(&self) -> (Option<i64>, Option<String>) {
        let detail = self.error_code.as_deref().and_then(non_empty_string);
        match &self.code {
            Some(Value::Number(number)) => (number.as_i64(), detail),
            Some(Value::String(code)) => match code.trim().parse::<i64>() {
                Ok(numeric) => (Some(numeric), detail),
                Err(_) => (None, detail.or_else(|| non_empty_string(code))),
            },
            _ => (None, detail),
        }
    }

    pub fn into_failure(self, http_status: Option<u16>) -> StreamFailure {
        let (api_code, error_detail_code) = self.codes();
        StreamFailure::Api {
            http_status: http_status.or(self.status),
            api_code,
            error_detail_code,
            message: self.message.as_deref().and_then(non_empty_string),
        }
    }
}

/// Builds the error for a non-2xx response from its body.
pub fn parse_error_response(status: StatusCode, body: &str) -> ChatApiError {
    let fields = parse_error_fields(body);
    let (api_code, error_detail_code) = fields
        .as_ref()
        .map(ApiErrorFields::codes)
        .unwrap_or_default();
    let message = fields
        .and_then(|fields| fields.message)
        .and_then(|message| non_empty_string(&message))
        .or_else(|| non_empty_string(body.trim()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

    ChatApiError::Status {
        status,
        api_code,
        error_detail_code,
        message,
    }
}

pub(crate) fn parse_error_fields(body: &str) -> Option<ApiErrorFields> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    let nested = value.get("error").filter(|error| error.is_object()).cloned();
    serde_json::from_value(nested.unwrap_or(value)).ok()
}

fn describe_request_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("request timed out: {error}")
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}

fn non_empty_string(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}
