use std::fmt;
use uuid::Uuid;

/// Request correlation id; upstream ids are kept verbatim, missing ones are generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self { Self(Uuid::new_v4().to_string()) }

    /// Use `s` when it is non-blank, otherwise generate a fresh id.
    pub fn from_opt_str(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some(v) if !v.is_empty() => Self(v.to_string()),
            _ => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl Default for CorrelationId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// The caller of one operation: the owner supplied by the identity provider plus the
/// correlation id carried into logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub owner_id: String,
    pub request_id: CorrelationId,
}

impl RequestContext {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self { owner_id: owner_id.into(), request_id: CorrelationId::new() }
    }

    pub fn with_request_id(owner_id: impl Into<String>, request_id: Option<&str>) -> Self {
        Self { owner_id: owner_id.into(), request_id: CorrelationId::from_opt_str(request_id) }
    }

    pub fn owner(&self) -> &str { &self.owner_id }
}
