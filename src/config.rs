//! Configuration knobs. Loading a `DrpcConfig` from disk or environment is
//! a host application's job, not this crate's — only the struct shape and
//! its defaults live here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Content types unary calls may be encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryContentType {
    #[serde(rename = "application/proto")]
    Proto,
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/grpc-web+proto")]
    GrpcWebProto,
    #[serde(rename = "application/grpc+proto")]
    GrpcProto,
}

impl UnaryContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryContentType::Proto => "application/proto",
            UnaryContentType::Json => "application/json",
            UnaryContentType::GrpcWebProto => "application/grpc-web+proto",
            UnaryContentType::GrpcProto => "application/grpc+proto",
        }
    }
}

/// Content types streaming calls may be encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingContentType {
    #[serde(rename = "application/connect+proto")]
    ConnectProto,
    #[serde(rename = "application/connect+json")]
    ConnectJson,
    #[serde(rename = "application/grpc-web+proto")]
    GrpcWebProto,
    #[serde(rename = "application/grpc-web+json")]
    GrpcWebJson,
    #[serde(rename = "application/grpc+proto")]
    GrpcProto,
    #[serde(rename = "application/grpc+json")]
    GrpcJson,
}

impl StreamingContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamingContentType::ConnectProto => "application/connect+proto",
            StreamingContentType::ConnectJson => "application/connect+json",
            StreamingContentType::GrpcWebProto => "application/grpc-web+proto",
            StreamingContentType::GrpcWebJson => "application/grpc-web+json",
            StreamingContentType::GrpcProto => "application/grpc+proto",
            StreamingContentType::GrpcJson => "application/grpc+json",
        }
    }

    /// True if the wire bytes for this content type are JSON rather than
    /// binary protobuf — the one place the content-type matrix actually
    /// affects control flow (serializer selection), per the design notes.
    pub fn is_json(self) -> bool {
        self.as_str().contains("json")
    }
}

/// CORS policy for the HTTP gateway. Immutable once the server is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrpcConfig {
    /// `-1` disables the HTTP listener entirely.
    pub http_port: i32,
    pub http_host: String,
    #[serde(with = "duration_millis")]
    pub standard_interval: Duration,
    #[serde(with = "duration_millis")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub total_timeout: Duration,
    pub unary_content_type: UnaryContentType,
    pub streaming_content_type: StreamingContentType,
    pub cors: Option<CorsConfig>,
}

impl Default for DrpcConfig {
    fn default() -> Self {
        DrpcConfig {
            http_port: 9090,
            http_host: "localhost".into(),
            standard_interval: Duration::from_millis(400),
            dial_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            unary_content_type: UnaryContentType::Proto,
            streaming_content_type: StreamingContentType::ConnectProto,
            cors: None,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DrpcConfig::default();
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.http_host, "localhost");
        assert_eq!(cfg.standard_interval, Duration::from_millis(400));
        assert_eq!(cfg.dial_timeout, Duration::from_secs(30));
        assert_eq!(cfg.total_timeout, Duration::from_secs(60));
        assert!(cfg.cors.is_none());
    }

    #[test]
    fn streaming_content_type_json_detection() {
        assert!(StreamingContentType::ConnectJson.is_json());
        assert!(!StreamingContentType::ConnectProto.is_json());
        assert!(StreamingContentType::GrpcWebJson.is_json());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = DrpcConfig::default();
        let encoded = serde_json::to_string(&cfg).unwrap();
        let decoded: DrpcConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.http_port, cfg.http_port);
        assert_eq!(decoded.standard_interval, cfg.standard_interval);
    }
}
