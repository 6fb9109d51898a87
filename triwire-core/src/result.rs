//! The per-stream result model.
//!
//! A stream delivers exactly one [`StreamResult::Headers`], then zero or
//! more [`StreamResult::Message`]s in wire order, then exactly one
//! [`StreamResult::Complete`]. The same shape is used at two levels: the
//! transport emits `StreamResult<Bytes>` (raw chunks), and the stream
//! driver hands `StreamResult<T>` (decoded messages) to the caller.

use crate::code::Code;
use crate::error::ConnectError;
use crate::headers::Headers;

/// One event on a stream.
#[derive(Clone, Debug)]
pub enum StreamResult<T> {
    /// The response headers. Delivered once, before any message.
    Headers(Headers),
    /// One message, in wire order.
    Message(T),
    /// Terminal event; nothing follows it.
    Complete(Completion),
}

impl<T> StreamResult<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, StreamResult::Complete(_))
    }
}

/// How a stream ended.
#[derive(Clone, Debug, Default)]
pub struct Completion {
    pub code: Code,
    pub error: Option<ConnectError>,
    pub trailers: Headers,
}

impl Completion {
    /// A successful completion carrying trailers.
    pub fn ok(trailers: Headers) -> Self {
        Self {
            code: Code::Ok,
            error: None,
            trailers,
        }
    }

    /// A failed completion. The code is taken from the error.
    pub fn from_error(error: ConnectError) -> Self {
        Self {
            code: error.code(),
            trailers: error.metadata().clone(),
            error: Some(error),
        }
    }

    /// A failed completion with explicit trailers.
    pub fn from_error_with_trailers(error: ConnectError, trailers: Headers) -> Self {
        Self {
            code: error.code(),
            error: Some(error),
            trailers,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_ok() {
        let mut trailers = Headers::new();
        trailers.insert("k", "v");
        let completion = Completion::ok(trailers);

        assert!(completion.is_ok());
        assert_eq!(completion.code, Code::Ok);
        assert_eq!(completion.trailers.get("k"), Some("v"));
    }

    #[test]
    fn test_completion_from_error() {
        let err = ConnectError::new(Code::Canceled, "canceled by caller");
        let completion = Completion::from_error(err);

        assert!(!completion.is_ok());
        assert_eq!(completion.code, Code::Canceled);
        assert!(completion.error.is_some());
    }

    #[test]
    fn test_result_is_complete() {
        let headers: StreamResult<()> = StreamResult::Headers(Headers::new());
        assert!(!headers.is_complete());
        let complete: StreamResult<()> = StreamResult::Complete(Completion::default());
        assert!(complete.is_complete());
    }
}
