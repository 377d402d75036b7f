pub mod payload;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Every operation a client can name in a request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    // Identity
    Register,
    Login,
    Logout,
    ForgotPassword,
    ResetPassword,

    // Listing
    ListMyFiles,
    ListSharedWithMe,

    // Transfer
    UploadBegin,
    UploadNewVersionBegin,
    DownloadBegin,
    /// Client pacing signal before a download stream. Never answered on its own.
    Ready,

    // Mutation
    DeleteFile,
    RenameFile,

    // Sharing
    ShareAdd,
    ShareUpdate,
    ShareRemove,
    ListShares,

    // Versioning
    GetVersions,

    // Liveness
    Ping,
}

impl Operation {
    /// Identity bootstrap and liveness run without a session.
    pub fn requires_auth(self) -> bool {
        !matches!(
            self,
            Operation::Register
                | Operation::Login
                | Operation::ForgotPassword
                | Operation::ResetPassword
                | Operation::Ping
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same spelling as on the wire.
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ServerError,
}

/// Capability level on a file. Ordering is load-bearing: `Owner > Edit > View`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    View = 1,
    Edit = 2,
    Owner = 3,
}

impl PermissionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::View => "VIEW",
            PermissionLevel::Edit => "EDIT",
            PermissionLevel::Owner => "OWNER",
        }
    }

    /// `true` when this level grants at least `required`.
    pub fn satisfies(self, required: PermissionLevel) -> bool {
        self >= required
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VIEW" => Ok(PermissionLevel::View),
            "EDIT" => Ok(PermissionLevel::Edit),
            "OWNER" => Ok(PermissionLevel::Owner),
            other => Err(format!("unknown permission level: {}", other)),
        }
    }
}

/// Client → server envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub operation: Operation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    #[serde(default)]
    pub correlation_id: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Request {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            session_token: None,
            correlation_id: String::new(),
            data: Value::Null,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> serde_json::Result<Self> {
        self.data = serde_json::to_value(data)?;
        Ok(self)
    }

    /// Decode the operation-specific `data` map.
    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Server → client envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    pub status_code: StatusCode,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            status_code: StatusCode::Ok,
            message: message.into(),
            correlation_id: None,
            data: Value::Null,
        }
    }

    pub fn ok_with<T: Serialize>(message: impl Into<String>, data: &T) -> serde_json::Result<Self> {
        let mut response = Self::ok(message);
        response.data = serde_json::to_value(data)?;
        Ok(response)
    }

    pub fn error(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            message: message.into(),
            correlation_id: None,
            data: Value::Null,
        }
    }

    pub fn correlated(mut self, id: &str) -> Self {
        if !id.is_empty() {
            self.correlation_id = Some(id.to_string());
        }
        self
    }

    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
