//! JSON frames exchanged with a remote engine.
//!
//! Every request is `{ "id", "call": { "method", "params" } }` and every reply
//! is the envelope `{ "id", "data", "error": { "code", "message" } }` where
//! `error.code == 0` means success.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{EngineContext, EngineError, Notification, RemoteShareEngine, codes};
use crate::models::{Curve, ShareMaterial};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    #[serde(flatten)]
    pub context: EngineContext,
    pub curve: Curve,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupParams {
    #[serde(flatten)]
    pub context: EngineContext,
    pub signing_share: ShareMaterial,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverParams {
    #[serde(flatten)]
    pub context: EngineContext,
    pub backup_share: ShareMaterial,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyParams {
    #[serde(flatten)]
    pub context: EngineContext,
    pub notification: Notification,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EjectParams {
    pub client_backup_share: ShareMaterial,
    pub custodian_backup_share: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum EngineCall {
    Generate(GenerateParams),
    Backup(BackupParams),
    RecoverSigning(RecoverParams),
    RecoverBackup(RecoverParams),
    Notify(NotifyParams),
    Eject(EjectParams),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineRequest {
    pub id: u64,
    pub call: EngineCall,
}

/// `error` half of the reply envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemoteError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineReply {
    pub id: u64,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: RemoteError,
}

impl EngineReply {
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            data: Some(data),
            error: RemoteError::default(),
        }
    }

    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error: RemoteError {
                code,
                message: message.into(),
            },
        }
    }

    /// Unwraps the envelope: a non-zero code becomes [`EngineError::Remote`]
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, EngineError> {
        if self.error.code != codes::OK {
            return Err(EngineError::Remote {
                code: self.error.code,
                message: self.error.message,
            });
        }
        serde_json::from_value(self.data.unwrap_or(Value::Null))
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))
    }
}

/// Serves one request against an engine. Used by engine hosts and by
/// [`LoopbackTransport`](super::LoopbackTransport).
pub async fn dispatch(engine: &dyn RemoteShareEngine, request: EngineRequest) -> EngineReply {
    let id = request.id;
    let result = match request.call {
        EngineCall::Generate(p) => encode(engine.generate(&p.context, p.curve).await),
        EngineCall::Backup(p) => encode(engine.backup(&p.context, &p.signing_share).await),
        EngineCall::RecoverSigning(p) => encode(engine.recover_signing(&p.context, &p.backup_share).await),
        EngineCall::RecoverBackup(p) => encode(engine.recover_backup(&p.context, &p.backup_share).await),
        EngineCall::Notify(p) => encode(engine.notify(&p.context, &p.notification).await),
        EngineCall::Eject(p) => engine
            .eject(&p.client_backup_share, &p.custodian_backup_share)
            .await
            .map(|key| Value::String(key.expose().to_string())),
    };

    match result {
        Ok(data) => EngineReply::ok(id, data),
        Err(EngineError::Remote { code, message }) => EngineReply::err(id, code, message),
        Err(other) => EngineReply::err(id, codes::INTERNAL, other.to_string()),
    }
}

fn encode<T: serde::Serialize>(result: Result<T, EngineError>) -> Result<Value, EngineError> {
    result.and_then(|v| serde_json::to_value(v).map_err(|e| EngineError::MalformedResponse(e.to_string())))
}

/// Reply for a frame that could not be parsed at all
pub fn bad_request(id: u64, reason: &str) -> EngineReply {
    EngineReply::err(id, codes::BAD_REQUEST, format!("invalid request: {}", reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_request_shape() {
        let request = EngineRequest {
            id: 7,
            call: EngineCall::Generate(GenerateParams {
                context: EngineContext {
                    api_key: "k".into(),
                    host: "h".into(),
                    api_host: "a".into(),
                    metadata: Default::default(),
                },
                curve: Curve::Secp256k1,
            }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["call"]["method"], "generate");
        assert_eq!(value["call"]["params"]["apiKey"], "k");
        assert_eq!(value["call"]["params"]["apiHost"], "a");
        assert_eq!(value["call"]["params"]["curve"], "secp256k1");

        let parsed: EngineRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_nonzero_code_is_remote_error() {
        let reply: EngineReply = serde_json::from_value(json!({
            "id": 1,
            "data": null,
            "error": { "code": 104, "message": "unknown wallet" }
        }))
        .unwrap();
        let err = reply.into_result::<String>().unwrap_err();
        assert_eq!(err, EngineError::remote(104, "unknown wallet"));
    }

    #[test]
    fn test_zero_code_decodes_data() {
        let reply: EngineReply = serde_json::from_value(json!({
            "id": 1,
            "data": "0xabc",
            "error": { "code": 0, "message": "" }
        }))
        .unwrap();
        assert_eq!(reply.into_result::<String>().unwrap(), "0xabc");
    }

    #[test]
    fn test_missing_error_field_means_success() {
        let reply: EngineReply = serde_json::from_value(json!({ "id": 3, "data": null })).unwrap();
        reply.into_result::<()>().unwrap();
    }

    #[test]
    fn test_missing_data_is_malformed() {
        let reply = EngineReply {
            id: 2,
            data: None,
            error: RemoteError::default(),
        };
        let err = reply.into_result::<crate::engine::MintedShare>().unwrap_err();
        assert!(matches!(err, EngineError::MalformedResponse(_)));
    }
}
