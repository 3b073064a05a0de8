use std::backtrace::Backtrace;
use std::env;
use std::fmt;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::error;
use serde_json::json;

/// Application error carried by every fallible handler. Anything returned as
/// `Err` from a handler ends up in `error_response`, the single point where
/// failures become HTTP responses.
#[derive(Debug)]
pub struct AppError {
    pub message: String,
    pub status_code: u16,
    pub status: &'static str,
    pub is_operational: bool,
    backtrace: Backtrace,
}

impl AppError {
    /// An anticipated failure (bad input, missing resource) that is safe to
    /// describe to the caller.
    pub fn new(message: impl Into<String>, status_code: u16) -> Self {
        let status = if (400..500).contains(&status_code) {
            "fail"
        } else {
            "error"
        };
        AppError {
            message: message.into(),
            status_code,
            status,
            is_operational: true,
            backtrace: Backtrace::capture(),
        }
    }

    /// A defect. Its message is suppressed outside development.
    pub fn internal(message: impl Into<String>) -> Self {
        AppError {
            message: message.into(),
            status_code: 500,
            status: "error",
            is_operational: false,
            backtrace: Backtrace::capture(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        AppError::internal(format!("Database error: {}", err))
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(err: bcrypt::BcryptError) -> Self {
        AppError::internal(format!("Hashing error: {}", err))
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::internal(format!("Serialization error: {}", err))
    }
}

impl From<mongodb::bson::de::Error> for AppError {
    fn from(err: mongodb::bson::de::Error) -> Self {
        AppError::internal(format!("Deserialization error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::internal(format!("Serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut details: Vec<String> = errors
            .field_errors()
            .values()
            .flat_map(|errs| errs.iter())
            .map(|e| match &e.message {
                Some(message) => message.to_string(),
                None => e.code.to_string(),
            })
            .collect();
        details.sort();
        AppError::new(format!("Invalid input data. {}", details.join(". ")), 400)
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let development = env::var("RUST_ENV")
            .map(|v| v == "development")
            .unwrap_or(true);

        if development {
            return HttpResponse::build(self.status_code()).json(json!({
                "status": self.status,
                "error": {
                    "statusCode": self.status_code,
                    "isOperational": self.is_operational,
                },
                "message": self.message,
                "stack": self.backtrace.to_string(),
            }));
        }

        if self.is_operational {
            HttpResponse::build(self.status_code()).json(json!({
                "status": self.status,
                "message": self.message,
            }))
        } else {
            error!("Unexpected error: {}", self.message);
            HttpResponse::build(self.status_code()).json(json!({
                "status": "error",
                "message": "Something went very wrong!",
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn client_errors_are_fail() {
        let err = AppError::new("No tour found with that ID", 404);
        assert_eq!(err.status, "fail");
        assert_eq!(err.status_code, 404);
        assert!(err.is_operational);
    }

    #[test]
    fn server_errors_are_error() {
        let err = AppError::new("boom", 500);
        assert_eq!(err.status, "error");
        assert!(err.is_operational);
    }

    #[test]
    fn internal_errors_are_not_operational() {
        let err = AppError::internal("lost connection");
        assert_eq!(err.status_code, 500);
        assert_eq!(err.status, "error");
        assert!(!err.is_operational);
    }

    #[derive(Validate)]
    struct Payload {
        #[validate(length(min = 10, message = "A tour name must have more or equal than 10 characters"))]
        name: String,
    }

    #[test]
    fn validation_errors_become_400() {
        let payload = Payload {
            name: "short".to_string(),
        };
        let err: AppError = payload.validate().unwrap_err().into();
        assert_eq!(err.status_code, 400);
        assert_eq!(err.status, "fail");
        assert!(err.message.starts_with("Invalid input data. "));
        assert!(err.message.contains("more or equal than 10"));
    }
}
