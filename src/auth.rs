//! Optional bearer-token authentication for broker RPCs.

use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::error::{JudgeError, Result};

const AUTHORIZATION: &str = "authorization";

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Server side: rejects calls without the expected token. Accepts
/// everything when no token is configured.
#[derive(Clone, Default)]
pub struct RequireToken {
    expected: Option<String>,
}

impl RequireToken {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            expected: token.filter(|t| !t.is_empty()).map(bearer),
        }
    }
}

impl Interceptor for RequireToken {
    fn call(&mut self, request: Request<()>) -> std::result::Result<Request<()>, Status> {
        let Some(expected) = &self.expected else {
            return Ok(request);
        };
        match request.metadata().get(AUTHORIZATION) {
            Some(value) if value.as_bytes() == expected.as_bytes() => Ok(request),
            Some(_) => Err(Status::unauthenticated("invalid token")),
            None => Err(Status::unauthenticated("missing token")),
        }
    }
}

/// Client side: attaches the token to every call when one is configured.
#[derive(Clone, Default)]
pub struct AttachToken {
    header: Option<MetadataValue<Ascii>>,
}

impl AttachToken {
    pub fn new(token: Option<&str>) -> Result<Self> {
        let header = match token.filter(|t| !t.is_empty()) {
            Some(token) => Some(
                bearer(token)
                    .parse()
                    .map_err(|_| JudgeError::InvalidRequest("token is not valid ASCII".into()))?,
            ),
            None => None,
        };
        Ok(Self { header })
    }
}

impl Interceptor for AttachToken {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        if let Some(header) = &self.header {
            request.metadata_mut().insert(AUTHORIZATION, header.clone());
        }
        Ok(request)
    }
}
